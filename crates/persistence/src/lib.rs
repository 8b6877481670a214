use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Cast {
    pub id: i64,
    pub store_id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub phone_verified_at: Option<DateTime<Utc>>,
    pub line_user_id: Option<String>,
    #[serde(skip)]
    pub registration_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PhoneVerification {
    pub phone: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    /// Another cast already holds this LINE account.
    AlreadyLinkedElsewhere,
    CastNotFound,
}

const CAST_COLUMNS: &str = "id, store_id, name, phone, phone_verified_at, line_user_id, \
     registration_code, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteCastStore {
    pool: SqlitePool,
}

impl SqliteCastStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to SQLite database")?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database. A single connection keeps every query on the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        info!("SqliteCastStore initialized");
        Ok(Self { pool })
    }

    #[instrument(skip(self))]
    pub async fn create_cast(
        &self,
        store_id: i64,
        name: &str,
        phone: Option<&str>,
        registration_code: Option<&str>,
    ) -> Result<Cast> {
        let id = sqlx::query(
            r#"
            INSERT INTO casts (store_id, name, phone, registration_code)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(store_id)
        .bind(name)
        .bind(phone)
        .bind(registration_code)
        .execute(&self.pool)
        .await
        .context("Failed to insert cast")?
        .last_insert_rowid();

        self.get_cast(id)
            .await?
            .context("Inserted cast disappeared")
    }

    #[instrument(skip(self))]
    pub async fn get_cast(&self, id: i64) -> Result<Option<Cast>> {
        sqlx::query_as::<_, Cast>(&format!("SELECT {CAST_COLUMNS} FROM casts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch cast")
    }

    #[instrument(skip(self))]
    pub async fn find_by_line_user(&self, line_user_id: &str) -> Result<Option<Cast>> {
        sqlx::query_as::<_, Cast>(&format!(
            "SELECT {CAST_COLUMNS} FROM casts WHERE line_user_id = ?"
        ))
        .bind(line_user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch cast by LINE user")
    }

    #[instrument(skip(self, code))]
    pub async fn find_by_registration_code(&self, code: &str) -> Result<Option<Cast>> {
        sqlx::query_as::<_, Cast>(&format!(
            "SELECT {CAST_COLUMNS} FROM casts WHERE registration_code = ?"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch cast by registration code")
    }

    #[instrument(skip(self))]
    pub async fn list_casts(&self, store_id: Option<i64>, limit: i64) -> Result<Vec<Cast>> {
        sqlx::query_as::<_, Cast>(&format!(
            "SELECT {CAST_COLUMNS} FROM casts WHERE (? IS NULL OR store_id = ?) ORDER BY id LIMIT ?"
        ))
        .bind(store_id)
        .bind(store_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list casts")
    }

    /// Attach a LINE account to a cast and consume its registration code.
    #[instrument(skip(self))]
    pub async fn link_line_user(&self, cast_id: i64, line_user_id: &str) -> Result<LinkOutcome> {
        if let Some(existing) = self.find_by_line_user(line_user_id).await? {
            if existing.id == cast_id {
                return Ok(LinkOutcome::Linked);
            }
            return Ok(LinkOutcome::AlreadyLinkedElsewhere);
        }
        self.set_line_user(cast_id, line_user_id).await
    }

    /// A concurrent link of the same account can land between the lookup above
    /// and this update; the UNIQUE index then rejects the loser.
    async fn set_line_user(&self, cast_id: i64, line_user_id: &str) -> Result<LinkOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE casts
            SET line_user_id = ?, registration_code = NULL, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(line_user_id)
        .bind(cast_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 0 => Ok(LinkOutcome::CastNotFound),
            Ok(_) => Ok(LinkOutcome::Linked),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Ok(LinkOutcome::AlreadyLinkedElsewhere)
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to link LINE user")),
        }
    }

    /// Detach a LINE account. Returns the id of the cast it was linked to, if any.
    #[instrument(skip(self))]
    pub async fn unlink_line_user(&self, line_user_id: &str) -> Result<Option<i64>> {
        let Some(cast) = self.find_by_line_user(line_user_id).await? else {
            return Ok(None);
        };

        sqlx::query(
            "UPDATE casts SET line_user_id = NULL, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(cast.id)
        .execute(&self.pool)
        .await
        .context("Failed to unlink LINE user")?;

        Ok(Some(cast.id))
    }

    #[instrument(skip(self))]
    pub async fn mark_phone_verified(
        &self,
        cast_id: i64,
        phone: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE casts
            SET phone = ?, phone_verified_at = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(phone)
        .bind(at)
        .bind(cast_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark phone verified")?;
        Ok(result.rows_affected() > 0)
    }

    /// Store a fresh code for `phone`, replacing any previous one.
    #[instrument(skip(self, code))]
    pub async fn upsert_verification(
        &self,
        phone: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO phone_verifications (phone, code, expires_at, attempts, created_at)
            VALUES (?, ?, ?, 0, CURRENT_TIMESTAMP)
            ON CONFLICT(phone) DO UPDATE SET
                code = excluded.code,
                expires_at = excluded.expires_at,
                attempts = 0,
                created_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(phone)
        .bind(code)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to store verification code")?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_verification(&self, phone: &str) -> Result<Option<PhoneVerification>> {
        sqlx::query_as::<_, PhoneVerification>(
            "SELECT phone, code, expires_at, attempts, created_at FROM phone_verifications WHERE phone = ?",
        )
        .bind(phone)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch verification code")
    }

    /// Count one verification attempt against a live code and return the code.
    ///
    /// `None` when there is no row, it has expired, or `max_attempts` have
    /// already been used. The check and the increment are one statement, so
    /// concurrent callers can never take more than `max_attempts` between them.
    #[instrument(skip(self))]
    pub async fn reserve_verification_attempt(
        &self,
        phone: &str,
        max_attempts: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            UPDATE phone_verifications
            SET attempts = attempts + 1
            WHERE phone = ? AND attempts < ? AND expires_at > ?
            RETURNING code
            "#,
        )
        .bind(phone)
        .bind(max_attempts)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to reserve verification attempt")
    }

    #[instrument(skip(self))]
    pub async fn delete_verification(&self, phone: &str) -> Result<()> {
        sqlx::query("DELETE FROM phone_verifications WHERE phone = ?")
            .bind(phone)
            .execute(&self.pool)
            .await
            .context("Failed to delete verification code")?;
        Ok(())
    }

    /// Delete the row for `phone` only if it is expired or out of attempts,
    /// so a code issued in the meantime survives.
    #[instrument(skip(self))]
    pub async fn delete_dead_verification(
        &self,
        phone: &str,
        max_attempts: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM phone_verifications WHERE phone = ? AND (attempts >= ? OR expires_at <= ?)",
        )
        .bind(phone)
        .bind(max_attempts)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to delete dead verification code")?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn purge_expired_verifications(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM phone_verifications WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to purge verification codes")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn link_consumes_registration_code() {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let cast = store
            .create_cast(1, "Aoi", None, Some("ABC123"))
            .await
            .expect("cast");

        let found = store
            .find_by_registration_code("ABC123")
            .await
            .expect("query")
            .expect("cast by code");
        assert_eq!(found.id, cast.id);

        assert_eq!(
            store.link_line_user(cast.id, "U1").await.expect("link"),
            LinkOutcome::Linked
        );
        assert!(store
            .find_by_registration_code("ABC123")
            .await
            .expect("query")
            .is_none());
        let linked = store.find_by_line_user("U1").await.expect("query").expect("cast");
        assert_eq!(linked.id, cast.id);
    }

    #[tokio::test]
    async fn line_account_links_to_one_cast_only() {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let a = store.create_cast(1, "A", None, Some("AAA")).await.expect("cast");
        let b = store.create_cast(1, "B", None, Some("BBB")).await.expect("cast");

        store.link_line_user(a.id, "U1").await.expect("link");
        assert_eq!(
            store.link_line_user(b.id, "U1").await.expect("link"),
            LinkOutcome::AlreadyLinkedElsewhere
        );
        assert_eq!(
            store.link_line_user(999, "U2").await.expect("link"),
            LinkOutcome::CastNotFound
        );
    }

    #[tokio::test]
    async fn lost_link_race_is_already_linked_elsewhere() {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let a = store.create_cast(1, "A", None, Some("AAA")).await.expect("cast");
        let b = store.create_cast(1, "B", None, Some("BBB")).await.expect("cast");

        assert_eq!(store.set_line_user(a.id, "U1").await.expect("link"), LinkOutcome::Linked);
        // Second writer skipped the lookup, as it would after losing the race.
        assert_eq!(
            store.set_line_user(b.id, "U1").await.expect("link"),
            LinkOutcome::AlreadyLinkedElsewhere
        );
        let b = store.get_cast(b.id).await.expect("query").expect("cast");
        assert!(b.line_user_id.is_none());
        assert_eq!(b.registration_code.as_deref(), Some("BBB"));
    }

    #[tokio::test]
    async fn concurrent_links_of_one_account_pick_one_cast() {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let a = store.create_cast(1, "A", None, Some("AAA")).await.expect("cast");
        let b = store.create_cast(1, "B", None, Some("BBB")).await.expect("cast");

        let (ra, rb) = tokio::join!(
            store.link_line_user(a.id, "U1"),
            store.link_line_user(b.id, "U1")
        );
        let mut outcomes = vec![ra.expect("link a"), rb.expect("link b")];
        outcomes.sort_by_key(|o| *o != LinkOutcome::Linked);
        assert_eq!(
            outcomes,
            vec![LinkOutcome::Linked, LinkOutcome::AlreadyLinkedElsewhere]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn attempt_reservation_is_capped_under_concurrency() {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let now = Utc::now();
        store
            .upsert_verification("09012345678", "123456", now + Duration::minutes(10))
            .await
            .expect("upsert");

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .reserve_verification_attempt("09012345678", 5, now)
                        .await
                        .expect("reserve")
                })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.expect("join").is_some() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
        let row = store
            .get_verification("09012345678")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(row.attempts, 5);
    }

    #[tokio::test]
    async fn only_dead_verification_rows_are_deleted() {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let now = Utc::now();
        store
            .upsert_verification("09012345678", "123456", now + Duration::minutes(10))
            .await
            .expect("upsert");

        store
            .delete_dead_verification("09012345678", 5, now)
            .await
            .expect("delete");
        assert!(store.get_verification("09012345678").await.expect("query").is_some());

        for _ in 0..5 {
            store
                .reserve_verification_attempt("09012345678", 5, now)
                .await
                .expect("reserve");
        }
        store
            .delete_dead_verification("09012345678", 5, now)
            .await
            .expect("delete");
        assert!(store.get_verification("09012345678").await.expect("query").is_none());
    }

    #[tokio::test]
    async fn expired_code_cannot_be_reserved() {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let now = Utc::now();
        store
            .upsert_verification("09012345678", "123456", now - Duration::seconds(1))
            .await
            .expect("upsert");
        assert!(store
            .reserve_verification_attempt("09012345678", 5, now)
            .await
            .expect("reserve")
            .is_none());
        assert!(store
            .reserve_verification_attempt("09000000000", 5, now)
            .await
            .expect("reserve")
            .is_none());
    }

    #[tokio::test]
    async fn unlink_reports_previous_cast() {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let cast = store.create_cast(2, "C", None, None).await.expect("cast");
        store.link_line_user(cast.id, "U9").await.expect("link");

        assert_eq!(store.unlink_line_user("U9").await.expect("unlink"), Some(cast.id));
        assert_eq!(store.unlink_line_user("U9").await.expect("unlink"), None);
    }

    #[tokio::test]
    async fn verification_rows_are_replaced_and_purged() {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let now = Utc::now();

        store
            .upsert_verification("09012345678", "111111", now + Duration::minutes(10))
            .await
            .expect("upsert");
        assert_eq!(
            store
                .reserve_verification_attempt("09012345678", 5, now)
                .await
                .expect("attempt")
                .as_deref(),
            Some("111111")
        );
        store
            .upsert_verification("09012345678", "222222", now + Duration::minutes(10))
            .await
            .expect("upsert");

        let row = store
            .get_verification("09012345678")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(row.code, "222222");
        assert_eq!(row.attempts, 0);

        store
            .upsert_verification("08011112222", "333333", now - Duration::minutes(1))
            .await
            .expect("upsert");
        assert_eq!(store.purge_expired_verifications(now).await.expect("purge"), 1);
        assert!(store.get_verification("09012345678").await.expect("query").is_some());
    }

    #[tokio::test]
    async fn mark_phone_verified_sets_phone() {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let cast = store.create_cast(1, "D", None, None).await.expect("cast");
        let now = Utc::now();

        assert!(store
            .mark_phone_verified(cast.id, "09012345678", now)
            .await
            .expect("update"));
        let cast = store.get_cast(cast.id).await.expect("query").expect("cast");
        assert_eq!(cast.phone.as_deref(), Some("09012345678"));
        assert!(cast.phone_verified_at.is_some());
        assert!(!store.mark_phone_verified(999, "0", now).await.expect("update"));
    }
}
