pub mod models;
pub mod schema;

use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use fampoints_shared::domain;
use models::{
    LedgerEntry, NewFamily, NewLedgerEntry, NewRedemption, NewReward, NewSession, NewUser,
    Redemption, Reward, User,
};

/// Structured error type for all storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A Diesel ORM error (query failure, constraint violation, etc.)
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Failed to acquire or build a connection from the pool.
    #[error("pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    /// A `spawn_blocking` task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A database migration failed to apply.
    #[error("migration error: {0}")]
    Migration(String),

    /// A points credit with a zero or negative amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// The referenced entity does not exist (or is outside the family).
    #[error("not found: {0}")]
    NotFound(String),

    /// A redemption attempt against a balance that cannot cover it.
    #[error("insufficient points: need {required}, have {balance}")]
    InsufficientPoints { required: i64, balance: i64 },
}

/// Result of a successful reward redemption.
#[derive(Debug, Clone)]
pub struct Redeemed {
    pub reward_id: i32,
    pub points_spent: i64,
    pub new_balance: i64,
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    pub async fn connect_sqlite(path: &str) -> Result<Self, StorageError> {
        let url = path.to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder().max_size(8).build(manager)?;

        // Run pending Diesel migrations on startup (auto-init empty DBs)
        {
            let pool_clone = pool.clone();
            tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
                const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
                let mut conn = pool_clone.get()?;
                configure_sqlite_conn(&mut conn)?;
                conn.run_pending_migrations(MIGRATIONS)
                    .map_err(|e| StorageError::Migration(e.to_string()))?;
                Ok(())
            })
            .await??;
        }

        Ok(Store { pool })
    }

    pub async fn seed_from_config(
        &self,
        cfg_families: &[domain::Family],
        cfg_users: &[domain::User],
    ) -> Result<(), StorageError> {
        use schema::{families, users};

        let pool = self.pool.clone();
        let families_owned = cfg_families.to_owned();
        let users_owned = cfg_users.to_owned();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;

            // Upsert families
            for f in &families_owned {
                let new_family = NewFamily {
                    id: &f.id,
                    name: &f.name,
                };
                diesel::insert_into(families::table)
                    .values(&new_family)
                    .on_conflict(families::id)
                    .do_update()
                    .set(families::name.eq(new_family.name))
                    .execute(&mut conn)?;
            }

            // Upsert users; balances are computed from the ledger, never stored
            for u in &users_owned {
                let new_user = NewUser {
                    id: &u.id,
                    family_id: &u.family_id,
                    display_name: &u.display_name,
                    role: models::role_to_str(u.role),
                };
                diesel::insert_into(users::table)
                    .values(&new_user)
                    .on_conflict(users::id)
                    .do_update()
                    .set((
                        users::family_id.eq(new_user.family_id),
                        users::display_name.eq(new_user.display_name),
                        users::role.eq(new_user.role),
                    ))
                    .execute(&mut conn)?;
            }

            Ok(())
        })
        .await?
    }

    pub async fn get_user_in_family(
        &self,
        user: &str,
        family: &str,
    ) -> Result<Option<User>, StorageError> {
        use schema::users::dsl::*;
        let pool = self.pool.clone();
        let uid = user.to_string();
        let fid = family.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<User>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(users
                .filter(id.eq(&uid))
                .filter(family_id.eq(&fid))
                .first::<User>(&mut conn)
                .optional()?)
        })
        .await?
    }

    /// All members of a family together with their current point totals.
    pub async fn list_members_with_balances(
        &self,
        family: &str,
    ) -> Result<Vec<(User, i64)>, StorageError> {
        let pool = self.pool.clone();
        let fid = family.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<(User, i64)>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use crate::storage::schema::users::dsl as u;
            let members = u::users
                .filter(u::family_id.eq(&fid))
                .order(u::display_name.asc())
                .load::<User>(&mut conn)?;

            use diesel::dsl::sql;
            use diesel::sql_types::{BigInt, Nullable};

            use crate::storage::schema::points_ledger::dsl as pl;
            let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
            let rows: Vec<(String, Option<i64>)> = pl::points_ledger
                .filter(pl::user_id.eq_any(&ids))
                .group_by(pl::user_id)
                .select((pl::user_id, sql::<Nullable<BigInt>>("SUM(points)")))
                .load::<(String, Option<i64>)>(&mut conn)?;
            let mut totals: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
            for (uid, total) in rows {
                totals.insert(uid, total.unwrap_or(0));
            }
            let out = members
                .into_iter()
                .map(|m| {
                    let total = totals.get(&m.id).copied().unwrap_or(0);
                    (m, total)
                })
                .collect();
            Ok(out)
        })
        .await?
    }

    /// Current balance, defined as the sum of all ledger entries for the user.
    pub async fn compute_balance(&self, user: &str) -> Result<i64, StorageError> {
        use diesel::dsl::sql;
        use diesel::sql_types::{BigInt, Nullable};
        let pool = self.pool.clone();
        let uid = user.to_string();
        tokio::task::spawn_blocking(move || -> Result<i64, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let total: Option<i64> = schema::points_ledger::dsl::points_ledger
                .filter(schema::points_ledger::dsl::user_id.eq(&uid))
                .select(sql::<Nullable<BigInt>>("SUM(points)"))
                .first::<Option<i64>>(&mut conn)?;
            Ok(total.unwrap_or(0))
        })
        .await?
    }

    /// Append a positive ledger entry. The ledger is append-only; corrections
    /// are new entries, never updates.
    pub async fn credit_points(
        &self,
        user: &str,
        points: i64,
        reason: &str,
    ) -> Result<LedgerEntry, StorageError> {
        use schema::points_ledger;
        if points <= 0 {
            return Err(StorageError::InvalidAmount(points));
        }
        let pool = self.pool.clone();
        let uid = user.to_string();
        let reason_owned = reason.to_string();
        tokio::task::spawn_blocking(move || -> Result<LedgerEntry, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let rec = NewLedgerEntry {
                user_id: &uid,
                points,
                reason: &reason_owned,
            };
            Ok(diesel::insert_into(points_ledger::table)
                .values(&rec)
                .returning(LedgerEntry::as_returning())
                .get_result::<LedgerEntry>(&mut conn)?)
        })
        .await?
    }

    pub async fn list_ledger_for_user(
        &self,
        user: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        let pool = self.pool.clone();
        let uid = user.to_string();
        let page = page.max(1);
        let per_page = per_page.clamp(1, 1000) as i64;
        let offset = ((page as i64) - 1) * per_page;
        tokio::task::spawn_blocking(move || -> Result<Vec<LedgerEntry>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use crate::storage::schema::points_ledger::dsl as pl;
            Ok(pl::points_ledger
                .filter(pl::user_id.eq(&uid))
                .order((pl::created_at.desc(), pl::id.desc()))
                .offset(offset)
                .limit(per_page)
                .select(LedgerEntry::as_select())
                .load::<LedgerEntry>(&mut conn)?)
        })
        .await?
    }

    pub async fn create_reward(
        &self,
        family: &str,
        name: &str,
        description: Option<&str>,
        points_required: i64,
    ) -> Result<Reward, StorageError> {
        use schema::rewards;
        let pool = self.pool.clone();
        let fid = family.to_string();
        let name_owned = name.to_string();
        let description_owned = description.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || -> Result<Reward, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let new_reward = NewReward {
                family_id: &fid,
                name: &name_owned,
                description: description_owned.as_deref(),
                points_required,
            };
            Ok(diesel::insert_into(rewards::table)
                .values(&new_reward)
                .returning(Reward::as_returning())
                .get_result::<Reward>(&mut conn)?)
        })
        .await?
    }

    pub async fn list_rewards_for_family(&self, family: &str) -> Result<Vec<Reward>, StorageError> {
        let pool = self.pool.clone();
        let fid = family.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<Reward>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use crate::storage::schema::rewards::dsl as r;
            Ok(r::rewards
                .filter(r::family_id.eq(&fid))
                .order(r::name.asc())
                .select(Reward::as_select())
                .load::<Reward>(&mut conn)?)
        })
        .await?
    }

    /// Redeem a reward for a user: check the balance and append the debit in
    /// one transaction. `BEGIN IMMEDIATE` takes the write lock up front, so
    /// two concurrent redemptions observe each other's committed debit and
    /// cannot drive the balance negative.
    pub async fn redeem_reward(
        &self,
        user: &str,
        reward: i32,
        family: &str,
    ) -> Result<Redeemed, StorageError> {
        let pool = self.pool.clone();
        let uid = user.to_string();
        let fid = family.to_string();
        tokio::task::spawn_blocking(move || -> Result<Redeemed, StorageError> {
            use crate::storage::schema::{points_ledger, redemptions, rewards};
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<Redeemed, StorageError> {
                let found: Option<Reward> = rewards::table
                    .filter(rewards::id.eq(reward))
                    .filter(rewards::family_id.eq(&fid))
                    .select(Reward::as_select())
                    .first::<Reward>(conn)
                    .optional()?;
                let Some(reward_row) = found else {
                    return Err(StorageError::NotFound(format!("reward not found: {reward}")));
                };

                use diesel::dsl::sql;
                use diesel::sql_types::{BigInt, Nullable};
                let balance: i64 = points_ledger::table
                    .filter(points_ledger::user_id.eq(&uid))
                    .select(sql::<Nullable<BigInt>>("SUM(points)"))
                    .first::<Option<i64>>(conn)?
                    .unwrap_or(0);
                if balance < reward_row.points_required {
                    return Err(StorageError::InsufficientPoints {
                        required: reward_row.points_required,
                        balance,
                    });
                }

                let reason = format!("redeemed:{}", reward_row.name);
                let debit = NewLedgerEntry {
                    user_id: &uid,
                    points: -reward_row.points_required,
                    reason: &reason,
                };
                diesel::insert_into(points_ledger::table)
                    .values(&debit)
                    .execute(conn)?;
                let rec = NewRedemption {
                    user_id: &uid,
                    reward_id: reward,
                    points_spent: reward_row.points_required,
                };
                diesel::insert_into(redemptions::table)
                    .values(&rec)
                    .execute(conn)?;
                Ok(Redeemed {
                    reward_id: reward,
                    points_spent: reward_row.points_required,
                    new_balance: balance - reward_row.points_required,
                })
            })
        })
        .await?
    }

    pub async fn list_redemptions_for_user(
        &self,
        user: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<(Redemption, Option<String>)>, StorageError> {
        let pool = self.pool.clone();
        let uid = user.to_string();
        let page = page.max(1);
        let per_page = per_page.clamp(1, 1000) as i64;
        let offset = ((page as i64) - 1) * per_page;
        tokio::task::spawn_blocking(
            move || -> Result<Vec<(Redemption, Option<String>)>, StorageError> {
                let mut conn = pool.get()?;
                configure_sqlite_conn(&mut conn)?;
                use crate::storage::schema::{redemptions, rewards};
                Ok(redemptions::table
                    .left_join(rewards::table)
                    .filter(redemptions::user_id.eq(&uid))
                    .order((redemptions::redeemed_at.desc(), redemptions::id.desc()))
                    .offset(offset)
                    .limit(per_page)
                    .select((Redemption::as_select(), rewards::name.nullable()))
                    .load::<(Redemption, Option<String>)>(&mut conn)?)
            },
        )
        .await?
    }

    // Session helpers for JWT inactivity windows
    pub async fn create_session(&self, jti_: &str, username_: &str) -> Result<(), StorageError> {
        use schema::sessions;
        let pool = self.pool.clone();
        let j = jti_.to_string();
        let u = username_.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let new = NewSession {
                jti: &j,
                username: &u,
            };
            diesel::insert_into(sessions::table)
                .values(&new)
                .on_conflict_do_nothing()
                .execute(&mut conn)?;
            Ok(())
        })
        .await?
    }

    /// Touch session atomically, but only if it hasn't expired.
    /// Returns `true` if the session was found and updated, `false` otherwise.
    ///
    /// This combines the idle timeout check and the `last_used_at` update into
    /// a single atomic UPDATE, eliminating the race condition between checking
    /// and updating the session.
    pub async fn touch_session_with_cutoff(
        &self,
        jti_: &str,
        cutoff: chrono::NaiveDateTime,
    ) -> Result<bool, StorageError> {
        use schema::sessions::dsl::*;
        let pool = self.pool.clone();
        let j = jti_.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let now = Utc::now().naive_utc();
            let updated =
                diesel::update(sessions.filter(jti.eq(&j)).filter(last_used_at.ge(cutoff)))
                    .set(last_used_at.eq(now))
                    .execute(&mut conn)?;
            Ok(updated > 0)
        })
        .await?
    }
}

fn configure_sqlite_conn(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Enable WAL for better read/write concurrency and set a busy timeout
    // Ignore the result rows; Diesel's execute is fine for PRAGMAs
    diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous=NORMAL;").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout=5000;").execute(conn)?;
    Ok(())
}
