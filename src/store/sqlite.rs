use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::{
    topics_from_json, AssessmentStore, GraphStore, MasteryStore, SessionStore, StoreError,
};
use crate::tutor::types::{Difficulty, LearningStep, Session};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "topics" (
    "subject_key" TEXT NOT NULL,
    "topic_key" TEXT NOT NULL,
    "subject" TEXT NOT NULL,
    "name" TEXT NOT NULL,
    "created_at" TEXT NOT NULL,
    PRIMARY KEY ("subject_key", "topic_key")
);
CREATE TABLE IF NOT EXISTS "prerequisites" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "subject_key" TEXT NOT NULL,
    "dependent_key" TEXT NOT NULL,
    "prerequisite_key" TEXT NOT NULL,
    UNIQUE ("subject_key", "dependent_key", "prerequisite_key")
);
CREATE INDEX IF NOT EXISTS "idx_prerequisites_prerequisite" ON "prerequisites" ("subject_key", "prerequisite_key");
CREATE TABLE IF NOT EXISTS "mastery" (
    "student_id" TEXT NOT NULL,
    "subject" TEXT NOT NULL,
    "topic" TEXT NOT NULL,
    "topic_key" TEXT NOT NULL,
    "mastery" REAL NOT NULL,
    "updated_at" TEXT NOT NULL,
    PRIMARY KEY ("student_id", "subject", "topic_key")
);
CREATE TABLE IF NOT EXISTS "learning_sessions" (
    "session_id" TEXT PRIMARY KEY,
    "student_id" TEXT NOT NULL,
    "subject" TEXT NOT NULL,
    "exam_id" TEXT,
    "start_time" TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS "learning_steps" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "session_id" TEXT NOT NULL,
    "sequence" INTEGER NOT NULL,
    "student_id" TEXT NOT NULL,
    "topic" TEXT NOT NULL,
    "difficulty" TEXT NOT NULL,
    "score" REAL NOT NULL,
    "feedback" TEXT NOT NULL,
    "mastery_before" REAL NOT NULL,
    "mastery_after" REAL NOT NULL,
    "action_taken" INTEGER NOT NULL,
    "reward" REAL NOT NULL,
    "recorded_at" TEXT NOT NULL,
    UNIQUE ("session_id", "sequence")
);
CREATE INDEX IF NOT EXISTS "idx_learning_steps_student" ON "learning_steps" ("student_id", "id");
CREATE TABLE IF NOT EXISTS "assessments" (
    "exam_id" TEXT PRIMARY KEY,
    "topics" TEXT NOT NULL
);
"#;

const ANCESTORS_SQL: &str = r#"
WITH RECURSIVE "walk"("topic_key", "hop") AS (
    SELECT "prerequisite_key", 1 FROM "prerequisites"
    WHERE "subject_key" = ?1 AND "dependent_key" = ?2
    UNION
    SELECT p."prerequisite_key", w."hop" + 1 FROM "prerequisites" p
    JOIN "walk" w ON p."dependent_key" = w."topic_key"
    WHERE p."subject_key" = ?1 AND w."hop" < ?3
)
SELECT t."name" AS "name", MIN(w."hop") AS "hop" FROM "walk" w
JOIN "topics" t ON t."subject_key" = ?1 AND t."topic_key" = w."topic_key"
WHERE w."topic_key" <> ?2
GROUP BY w."topic_key", t."name"
ORDER BY "hop" ASC, "name" ASC
"#;

const DESCENDANTS_SQL: &str = r#"
WITH RECURSIVE "walk"("topic_key", "hop") AS (
    SELECT "dependent_key", 1 FROM "prerequisites"
    WHERE "subject_key" = ?1 AND "prerequisite_key" = ?2
    UNION
    SELECT p."dependent_key", w."hop" + 1 FROM "prerequisites" p
    JOIN "walk" w ON p."prerequisite_key" = w."topic_key"
    WHERE p."subject_key" = ?1 AND w."hop" < ?3
)
SELECT t."name" AS "name", MIN(w."hop") AS "hop" FROM "walk" w
JOIN "topics" t ON t."subject_key" = ?1 AND t."topic_key" = w."topic_key"
WHERE w."topic_key" <> ?2
GROUP BY w."topic_key", t."name"
ORDER BY "hop" ASC, "name" ASC
"#;

/// File-backed store for graph, mastery, sessions and the learning log.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Arc<Self>, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        tracing::info!("sqlite store ready");

        Ok(Arc::new(Self { pool }))
    }

    pub async fn open(path: &Path) -> Result<Arc<Self>, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("create {}: {e}", parent.display())))?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.display())).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        for stmt in SCHEMA_SQL.split(';') {
            let trimmed = stmt.trim();
            if trimmed.is_empty() {
                continue;
            }
            sqlx::query(trimmed).execute(pool).await?;
        }
        Ok(())
    }

    async fn ensure_topic_key(
        &self,
        subject: &str,
        topic: &str,
    ) -> Result<String, StoreError> {
        let key = normalize(topic);
        sqlx::query(
            r#"INSERT OR IGNORE INTO "topics" ("subject_key", "topic_key", "subject", "name", "created_at")
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(normalize(subject))
        .bind(&key)
        .bind(subject.trim())
        .bind(topic.trim())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(key)
    }

    async fn walk(
        &self,
        sql: &str,
        subject: &str,
        topic: &str,
        max_hops: usize,
    ) -> Result<Vec<(String, usize)>, StoreError> {
        if max_hops == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(sql)
            .bind(normalize(subject))
            .bind(normalize(topic))
            .bind(max_hops as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<(String, usize), StoreError> {
                let name: String = row.try_get("name")?;
                let hop: i64 = row.try_get("hop")?;
                Ok((name, hop.max(0) as usize))
            })
            .collect()
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

fn map_session(row: &SqliteRow) -> Result<Session, StoreError> {
    let started_at: String = row.try_get("start_time")?;
    Ok(Session {
        id: row.try_get("session_id")?,
        student_id: row.try_get("student_id")?,
        subject: row.try_get("subject")?,
        source_assessment: row.try_get("exam_id")?,
        started_at: parse_timestamp(&started_at),
    })
}

fn map_step(row: &SqliteRow) -> Result<LearningStep, StoreError> {
    let difficulty: String = row.try_get("difficulty")?;
    let recorded_at: String = row.try_get("recorded_at")?;
    let sequence: i64 = row.try_get("sequence")?;
    let action_taken: i64 = row.try_get("action_taken")?;
    Ok(LearningStep {
        session_id: row.try_get("session_id")?,
        sequence: sequence.max(0) as u64,
        student_id: row.try_get("student_id")?,
        topic: row.try_get("topic")?,
        difficulty: Difficulty::parse(&difficulty),
        score: row.try_get("score")?,
        feedback: row.try_get("feedback")?,
        mastery_before: row.try_get("mastery_before")?,
        mastery_after: row.try_get("mastery_after")?,
        action_taken: action_taken.max(0) as usize,
        reward: row.try_get("reward")?,
        recorded_at: parse_timestamp(&recorded_at),
    })
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn get_direct_prerequisites(
        &self,
        subject: &str,
        topic: &str,
    ) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT t."name" FROM "prerequisites" p
               JOIN "topics" t ON t."subject_key" = p."subject_key" AND t."topic_key" = p."prerequisite_key"
               WHERE p."subject_key" = ? AND p."dependent_key" = ?
               ORDER BY p."id" ASC"#,
        )
        .bind(normalize(subject))
        .bind(normalize(topic))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn get_ancestors_by_distance(
        &self,
        subject: &str,
        topic: &str,
        max_hops: usize,
    ) -> Result<Vec<(String, usize)>, StoreError> {
        self.walk(ANCESTORS_SQL, subject, topic, max_hops).await
    }

    async fn get_descendants_by_distance(
        &self,
        subject: &str,
        topic: &str,
        max_hops: usize,
    ) -> Result<Vec<(String, usize)>, StoreError> {
        self.walk(DESCENDANTS_SQL, subject, topic, max_hops).await
    }

    async fn ensure_topic(&self, subject: &str, topic: &str) -> Result<(), StoreError> {
        self.ensure_topic_key(subject, topic).await?;
        Ok(())
    }

    async fn ensure_prerequisite_edge(
        &self,
        subject: &str,
        topic: &str,
        prerequisite: &str,
    ) -> Result<(), StoreError> {
        let dependent_key = self.ensure_topic_key(subject, topic).await?;
        let prerequisite_key = self.ensure_topic_key(subject, prerequisite).await?;
        if dependent_key == prerequisite_key {
            return Ok(());
        }
        sqlx::query(
            r#"INSERT OR IGNORE INTO "prerequisites" ("subject_key", "dependent_key", "prerequisite_key")
               VALUES (?, ?, ?)"#,
        )
        .bind(normalize(subject))
        .bind(dependent_key)
        .bind(prerequisite_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn subject_topics(&self, subject: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT "name" FROM "topics" WHERE "subject_key" = ? ORDER BY "created_at" ASC, "rowid" ASC"#,
        )
        .bind(normalize(subject))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

#[async_trait]
impl MasteryStore for SqliteStore {
    async fn get_mastery_map(
        &self,
        student_id: &str,
        subject: &str,
    ) -> Result<HashMap<String, f64>, StoreError> {
        let rows: Vec<(String, f64)> = sqlx::query_as(
            r#"SELECT "topic", "mastery" FROM "mastery" WHERE "student_id" = ? AND "subject" = ?"#,
        )
        .bind(student_id)
        .bind(subject)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn set_mastery(
        &self,
        student_id: &str,
        subject: &str,
        topic: &str,
        value: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO "mastery" ("student_id", "subject", "topic", "topic_key", "mastery", "updated_at")
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT ("student_id", "subject", "topic_key")
               DO UPDATE SET "mastery" = excluded."mastery", "updated_at" = excluded."updated_at""#,
        )
        .bind(student_id)
        .bind(subject)
        .bind(topic)
        .bind(normalize(topic))
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO "learning_sessions" ("session_id", "student_id", "subject", "exam_id", "start_time")
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&session.id)
        .bind(&session.student_id)
        .bind(&session.subject)
        .bind(session.source_assessment.as_deref())
        .bind(session.started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(r#"SELECT * FROM "learning_sessions" WHERE "session_id" = ? LIMIT 1"#)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_session).transpose()
    }

    async fn append_learning_step(&self, step: &LearningStep) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO "learning_steps"
               ("session_id", "sequence", "student_id", "topic", "difficulty", "score", "feedback",
                "mastery_before", "mastery_after", "action_taken", "reward", "recorded_at")
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&step.session_id)
        .bind(step.sequence as i64)
        .bind(&step.student_id)
        .bind(&step.topic)
        .bind(step.difficulty.as_str())
        .bind(step.score)
        .bind(&step.feedback)
        .bind(step.mastery_before)
        .bind(step.mastery_after)
        .bind(step.action_taken as i64)
        .bind(step.reward)
        .bind(step.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_learning_steps(
        &self,
        student_id: &str,
        limit: usize,
    ) -> Result<Vec<LearningStep>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM "learning_steps" WHERE "student_id" = ? ORDER BY "id" DESC LIMIT ?"#,
        )
        .bind(student_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_step).collect()
    }

    async fn session_steps(&self, session_id: &str) -> Result<Vec<LearningStep>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM "learning_steps" WHERE "session_id" = ? ORDER BY "sequence" ASC"#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_step).collect()
    }
}

#[async_trait]
impl AssessmentStore for SqliteStore {
    async fn register_assessment(
        &self,
        assessment_id: &str,
        topics: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(topics)?;
        sqlx::query(
            r#"INSERT INTO "assessments" ("exam_id", "topics") VALUES (?, ?)
               ON CONFLICT ("exam_id") DO UPDATE SET "topics" = excluded."topics""#,
        )
        .bind(assessment_id)
        .bind(encoded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn assessment_topics(&self, assessment_id: &str) -> Result<Vec<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as(r#"SELECT "topics" FROM "assessments" WHERE "exam_id" = ? LIMIT 1"#)
                .bind(assessment_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((raw,)) = row else {
            return Ok(Vec::new());
        };
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        Ok(topics_from_json(&value))
    }
}
