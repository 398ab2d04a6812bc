use super::{parse_ts, ts, Store};
use crate::atoms::error::EngineResult;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub persona: String,
    pub created_at: DateTime<Utc>,
}

/// A generated character asset row; kind "reference" rows are the 4-stage
/// dataset outputs, keyed unique by (character, kind, stage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterImage {
    pub id: String,
    pub character_id: String,
    pub kind: String,
    pub stage: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub fn upsert_character(&self, character: &Character) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO characters (id, name, persona, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                persona = excluded.persona",
            params![
                character.id,
                character.name,
                character.persona,
                ts(character.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_character(&self, id: &str) -> EngineResult<Option<Character>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, persona, created_at FROM characters WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(id, name, persona, created)| Character {
            id,
            name,
            persona,
            created_at: parse_ts(&created),
        }))
    }

    /// Idempotent per (character, kind, stage): a crashed job re-running a
    /// stage overwrites its own row instead of duplicating.
    pub fn record_character_image(&self, image: &CharacterImage) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO character_images (id, character_id, kind, stage, path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(character_id, kind, stage) DO UPDATE SET
                path = excluded.path",
            params![
                image.id,
                image.character_id,
                image.kind,
                image.stage,
                image.path,
                ts(image.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_character_images(
        &self,
        character_id: &str,
        kind: &str,
    ) -> EngineResult<Vec<CharacterImage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, character_id, kind, stage, path, created_at
             FROM character_images
             WHERE character_id = ?1 AND kind = ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![character_id, kind], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, character_id, kind, stage, path, created)| CharacterImage {
                id,
                character_id,
                kind,
                stage,
                path,
                created_at: parse_ts(&created),
            })
            .collect())
    }

    // ── Translations ───────────────────────────────────────────────────

    pub fn upsert_translation(
        &self,
        message_id: &str,
        lang: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO translations (message_id, lang, content, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(message_id, lang) DO UPDATE SET content = excluded.content",
            params![message_id, lang, content, ts(at)],
        )?;
        Ok(())
    }

    pub fn get_translation(&self, message_id: &str, lang: &str) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT content FROM translations WHERE message_id = ?1 AND lang = ?2",
                params![message_id, lang],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }
}
