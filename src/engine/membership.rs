// ── Membership core ────────────────────────────────────────────────────────
// Multi-user conversation membership: invites, joins, kicks, ownership, and
// 7-day invite tokens. Invariants enforced here: exactly one active OWNER,
// active members never exceed max_users, and `can_invite` for non-owner
// roles follows the conversation's allow_user_invites flag.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Conversation, Membership, MembershipRole};
use crate::engine::auth::TokenSigner;
use crate::engine::clock::SharedClock;
use crate::engine::store::Store;
use log::info;
use std::sync::Arc;

pub struct MembershipCore {
    store: Arc<Store>,
    signer: Arc<TokenSigner>,
    clock: SharedClock,
}

impl MembershipCore {
    pub fn new(store: Arc<Store>, signer: Arc<TokenSigner>, clock: SharedClock) -> Self {
        MembershipCore {
            store,
            signer,
            clock,
        }
    }

    /// Create a conversation with its OWNER membership.
    pub fn create_conversation(&self, conv: &Conversation) -> EngineResult<Membership> {
        if conv.max_users > crate::atoms::constants::CONVERSATION_MAX_USERS_CAP {
            return Err(EngineError::Validation(format!(
                "max_users cannot exceed {}",
                crate::atoms::constants::CONVERSATION_MAX_USERS_CAP
            )));
        }
        self.store.insert_conversation(conv)?;
        let owner = Membership {
            conversation_id: conv.id.clone(),
            user_id: conv.owner_user_id.clone(),
            role: MembershipRole::Owner,
            can_write: true,
            can_invite: true,
            can_moderate: true,
            is_active: true,
            invited_by: None,
            joined_at: self.clock.now(),
        };
        self.store.upsert_membership(&owner)?;
        Ok(owner)
    }

    /// Active membership for (conversation, user), or None.
    pub fn active_membership(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> EngineResult<Option<Membership>> {
        Ok(self
            .store
            .get_membership(conversation_id, user_id)?
            .filter(|m| m.is_active))
    }

    fn require_active(&self, conversation_id: &str, user_id: &str) -> EngineResult<Membership> {
        self.active_membership(conversation_id, user_id)?
            .ok_or_else(|| {
                EngineError::Forbidden(format!("{user_id} is not a member of {conversation_id}"))
            })
    }

    fn check_capacity(&self, conv: &Conversation) -> EngineResult<()> {
        let active = self.store.count_active_members(&conv.id)?;
        if active >= conv.max_users {
            return Err(EngineError::Conflict("capacity reached".into()));
        }
        Ok(())
    }

    /// Admit `user_id` as a regular member, reactivating an inactive row if
    /// one exists. Capacity must have been checked by the caller.
    fn admit(
        &self,
        conv: &Conversation,
        user_id: &str,
        invited_by: Option<&str>,
    ) -> EngineResult<Membership> {
        let membership = Membership {
            conversation_id: conv.id.clone(),
            user_id: user_id.to_string(),
            role: MembershipRole::Member,
            can_write: true,
            can_invite: conv.allow_user_invites,
            can_moderate: false,
            is_active: true,
            invited_by: invited_by.map(str::to_string),
            joined_at: self.clock.now(),
        };
        self.store.upsert_membership(&membership)?;
        info!("[membership] {} joined {}", user_id, conv.id);
        Ok(membership)
    }

    /// Direct invite by an existing member with invite rights.
    pub fn invite(
        &self,
        conversation_id: &str,
        invitee_id: &str,
        by_user_id: &str,
    ) -> EngineResult<Membership> {
        let conv = self.store.require_conversation(conversation_id)?;
        let inviter = self.require_active(conversation_id, by_user_id)?;
        if !inviter.can_invite {
            return Err(EngineError::Forbidden(format!(
                "{by_user_id} cannot invite to {conversation_id}"
            )));
        }

        if let Some(existing) = self.store.get_membership(conversation_id, invitee_id)? {
            if existing.is_active {
                return Err(EngineError::Conflict(format!(
                    "{invitee_id} is already a member"
                )));
            }
        }

        self.check_capacity(&conv)?;
        self.admit(&conv, invitee_id, Some(by_user_id))
    }

    /// Join an open conversation (no token needed). Idempotent for already
    /// active members.
    pub fn join(&self, conversation_id: &str, user_id: &str) -> EngineResult<Membership> {
        let conv = self.store.require_conversation(conversation_id)?;
        if let Some(existing) = self.active_membership(conversation_id, user_id)? {
            return Ok(existing);
        }
        if !conv.allow_user_invites {
            return Err(EngineError::Forbidden(
                "conversation is invite-only".into(),
            ));
        }
        self.check_capacity(&conv)?;
        self.admit(&conv, user_id, None)
    }

    /// Leave. The OWNER must transfer ownership first.
    pub fn leave(&self, conversation_id: &str, user_id: &str) -> EngineResult<()> {
        let membership = self.require_active(conversation_id, user_id)?;
        if membership.role == MembershipRole::Owner {
            return Err(EngineError::Conflict(
                "owner must transfer ownership before leaving".into(),
            ));
        }
        self.store
            .set_membership_active(conversation_id, user_id, false)?;
        info!("[membership] {} left {}", user_id, conversation_id);
        Ok(())
    }

    /// Remove another member. Requires moderation rights; the OWNER is
    /// untouchable.
    pub fn kick(
        &self,
        conversation_id: &str,
        target_id: &str,
        by_user_id: &str,
    ) -> EngineResult<()> {
        let by = self.require_active(conversation_id, by_user_id)?;
        if !by.can_moderate {
            return Err(EngineError::Forbidden(format!(
                "{by_user_id} cannot moderate {conversation_id}"
            )));
        }
        let target = self.require_active(conversation_id, target_id)?;
        if target.role == MembershipRole::Owner {
            return Err(EngineError::Conflict("cannot kick the owner".into()));
        }
        self.store
            .set_membership_active(conversation_id, target_id, false)?;
        info!("[membership] {} kicked from {} by {}", target_id, conversation_id, by_user_id);
        Ok(())
    }

    /// Transfer ownership atomically; the old owner becomes a moderator.
    pub fn transfer_ownership(
        &self,
        conversation_id: &str,
        from_user: &str,
        to_user: &str,
    ) -> EngineResult<()> {
        let from = self.require_active(conversation_id, from_user)?;
        if from.role != MembershipRole::Owner {
            return Err(EngineError::Forbidden("only the owner can transfer".into()));
        }
        self.require_active(conversation_id, to_user)?;
        self.store
            .transfer_ownership(conversation_id, from_user, to_user)
    }

    // ── Invite tokens ──────────────────────────────────────────────────

    /// 7-day bearer token bound to (conversation, inviter).
    pub fn generate_invite_token(
        &self,
        conversation_id: &str,
        by_user_id: &str,
    ) -> EngineResult<String> {
        self.store.require_conversation(conversation_id)?;
        let by = self.require_active(conversation_id, by_user_id)?;
        if !by.can_invite {
            return Err(EngineError::Forbidden(format!(
                "{by_user_id} cannot invite to {conversation_id}"
            )));
        }
        self.signer.issue_invite(conversation_id, by_user_id)
    }

    /// Accept an invite token. Idempotent: an already-active member gets
    /// their existing membership back. Capacity is enforced at accept time.
    pub fn accept_invite_token(&self, token: &str, user_id: &str) -> EngineResult<Membership> {
        let claims = self.signer.verify_invite(token)?;
        let conv = self.store.require_conversation(&claims.conversation_id)?;

        if let Some(existing) = self.active_membership(&conv.id, user_id)? {
            return Ok(existing);
        }

        // The inviter must still hold invite rights — a kicked inviter's
        // outstanding links die with them.
        let inviter = self.require_active(&conv.id, &claims.inviter_id)?;
        if !inviter.can_invite {
            return Err(EngineError::Forbidden("invite link no longer valid".into()));
        }

        self.check_capacity(&conv)?;
        self.admit(&conv, user_id, Some(&claims.inviter_id))
    }
}
