use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, ToSql};

use super::models::*;
use super::Database;

/// Maximum rows written by one multi-row chunk insert.
pub const CHUNK_BATCH_SIZE: usize = 500;

const CHUNK_INSERT_PREFIX: &str = "INSERT INTO transcript_chunks \
     (transcript_id, position, speaker_index, start_time, end_time, text) VALUES ";
const CHUNK_INSERT_SUFFIX: &str = " ON CONFLICT (transcript_id, position) DO NOTHING";

impl Database {
    // =========================================================================
    // Episodes (read-only outside of seeding)
    // =========================================================================

    pub fn get_episode(&self, id: i64) -> Result<Option<Episode>> {
        let conn = self.conn()?;
        let episode = conn
            .query_row(
                "SELECT id, title, audio_url, description FROM episodes WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Episode {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        audio_url: row.get(2)?,
                        description: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(episode)
    }

    pub fn create_episode(
        &self,
        title: &str,
        audio_url: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO episodes (title, audio_url, description) VALUES (?1, ?2, ?3)",
            params![title, audio_url, description],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // =========================================================================
    // Transcripts
    // =========================================================================

    pub fn get_transcript_by_episode(&self, episode_id: i64) -> Result<Option<Transcript>> {
        let conn = self.conn()?;
        let transcript = conn
            .query_row(
                "SELECT id, episode_id, status, error_message, created_at, completed_at
                 FROM transcripts WHERE episode_id = ?1",
                params![episode_id],
                transcript_from_row,
            )
            .optional()?;
        Ok(transcript)
    }

    /// Create the transcript row for an episode, or reset an existing one to
    /// `processing` so a failed or interrupted ingest can run again.
    pub fn create_transcript(&self, episode_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let id = conn.query_row(
            "INSERT INTO transcripts (episode_id, status, created_at)
             VALUES (?1, 'processing', ?2)
             ON CONFLICT (episode_id) DO UPDATE SET
                status = 'processing',
                error_message = NULL,
                completed_at = NULL
             RETURNING id",
            params![episode_id, Utc::now()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn update_transcript_status(
        &self,
        id: i64,
        status: TranscriptStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let updated = match (status, error_message.filter(|m| !m.is_empty())) {
            (TranscriptStatus::Failed, Some(message)) => conn.execute(
                "UPDATE transcripts SET status = ?1, error_message = ?2, completed_at = NULL
                 WHERE id = ?3",
                params![status.as_str(), message, id],
            )?,
            (TranscriptStatus::Complete, _) => conn.execute(
                "UPDATE transcripts SET status = ?1, completed_at = ?2, error_message = NULL
                 WHERE id = ?3",
                params![status.as_str(), Utc::now(), id],
            )?,
            _ => conn.execute(
                "UPDATE transcripts SET status = ?1, completed_at = NULL WHERE id = ?2",
                params![status.as_str(), id],
            )?,
        };

        if updated == 0 {
            return Err(anyhow!("transcript {} does not exist", id));
        }
        Ok(())
    }

    // =========================================================================
    // Chunks
    // =========================================================================

    /// Write chunks in multi-row batches of at most [`CHUNK_BATCH_SIZE`].
    ///
    /// Each `(transcript_id, position)` is write-once: rows that already exist
    /// are left untouched. Returns the number of rows actually inserted.
    pub fn save_chunks(&self, transcript_id: i64, chunks: &[NewChunk]) -> Result<usize> {
        let mut inserted = 0;

        for batch in chunks.chunks(CHUNK_BATCH_SIZE) {
            let sql = chunk_insert_sql(batch.len());
            let mut values: Vec<&dyn ToSql> = Vec::with_capacity(batch.len() * 6);
            for chunk in batch {
                values.push(&transcript_id);
                values.push(&chunk.position);
                values.push(&chunk.speaker_index);
                values.push(&chunk.start_time);
                values.push(&chunk.end_time);
                values.push(&chunk.text);
            }

            // Lock per batch so long transcripts don't starve other requests
            let conn = self.conn()?;
            inserted += conn.execute(&sql, values.as_slice())?;
        }

        if !chunks.is_empty() {
            log::debug!(
                "Saved {} of {} chunks for transcript {}",
                inserted,
                chunks.len(),
                transcript_id
            );
        }
        Ok(inserted)
    }

    pub fn get_chunks(&self, transcript_id: i64) -> Result<Vec<TranscriptChunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, transcript_id, position, speaker_index, start_time, end_time, text
             FROM transcript_chunks WHERE transcript_id = ?1
             ORDER BY position ASC",
        )?;

        let chunks = stmt
            .query_map(params![transcript_id], |row| {
                Ok(TranscriptChunk {
                    id: row.get(0)?,
                    transcript_id: row.get(1)?,
                    position: row.get(2)?,
                    speaker_index: row.get(3)?,
                    start_time: row.get(4)?,
                    end_time: row.get(5)?,
                    text: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(chunks)
    }

    // =========================================================================
    // Speakers
    // =========================================================================

    /// Last writer wins on the name.
    pub fn upsert_speaker(
        &self,
        transcript_id: i64,
        speaker_index: i64,
        speaker_name: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO transcript_speakers (transcript_id, speaker_index, speaker_name, inferred_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (transcript_id, speaker_index) DO UPDATE SET
                speaker_name = excluded.speaker_name,
                inferred_at = excluded.inferred_at",
            params![transcript_id, speaker_index, speaker_name, Utc::now()],
        )?;
        Ok(())
    }

    pub fn get_speakers(&self, transcript_id: i64) -> Result<Vec<TranscriptSpeaker>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, transcript_id, speaker_index, speaker_name, inferred_at
             FROM transcript_speakers WHERE transcript_id = ?1
             ORDER BY speaker_index ASC",
        )?;

        let speakers = stmt
            .query_map(params![transcript_id], |row| {
                Ok(TranscriptSpeaker {
                    id: row.get(0)?,
                    transcript_id: row.get(1)?,
                    speaker_index: row.get(2)?,
                    speaker_name: row.get(3)?,
                    inferred_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(speakers)
    }
}

fn transcript_from_row(row: &Row<'_>) -> rusqlite::Result<Transcript> {
    Ok(Transcript {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        status: row.get::<_, String>(2)?.into(),
        error_message: row.get(3)?,
        created_at: row.get(4)?,
        completed_at: row.get(5)?,
    })
}

fn chunk_insert_sql(rows: usize) -> String {
    let mut sql = String::with_capacity(
        CHUNK_INSERT_PREFIX.len() + CHUNK_INSERT_SUFFIX.len() + rows * 22,
    );
    sql.push_str(CHUNK_INSERT_PREFIX);
    for i in 0..rows {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str("(?, ?, ?, ?, ?, ?)");
    }
    sql.push_str(CHUNK_INSERT_SUFFIX);
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_insert_sql_shape() {
        let sql = chunk_insert_sql(2);
        assert!(sql.starts_with("INSERT INTO transcript_chunks"));
        assert_eq!(sql.matches("(?, ?, ?, ?, ?, ?)").count(), 2);
        assert!(sql.ends_with("ON CONFLICT (transcript_id, position) DO NOTHING"));
    }
}
