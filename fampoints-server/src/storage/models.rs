use crate::storage::schema::{families, points_ledger, redemptions, rewards, users};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use fampoints_shared::auth::Role;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = families)]
pub struct Family {
    pub id: String,
    pub name: String,
}

#[derive(Insertable)]
#[diesel(table_name = families)]
pub struct NewFamily<'a> {
    pub id: &'a str,
    pub name: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = users)]
#[diesel(belongs_to(Family, foreign_key = family_id))]
pub struct User {
    pub id: String,
    pub family_id: String,
    pub display_name: String,
    pub role: String,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub id: &'a str,
    pub family_id: &'a str,
    pub display_name: &'a str,
    pub role: &'a str,
}

/// Role column as stored in SQLite; unknown values read back as child.
pub fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::Parent => "parent",
        Role::Child => "child",
    }
}

pub fn role_from_str(s: &str) -> Role {
    match s {
        "parent" => Role::Parent,
        _ => Role::Child,
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = points_ledger)]
#[diesel(belongs_to(User, foreign_key = user_id))]
pub struct LedgerEntry {
    pub id: i32,
    pub user_id: String,
    pub points: i64,
    pub reason: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = points_ledger)]
pub struct NewLedgerEntry<'a> {
    pub user_id: &'a str,
    pub points: i64,
    pub reason: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = rewards)]
#[diesel(belongs_to(Family, foreign_key = family_id))]
pub struct Reward {
    pub id: i32,
    pub family_id: String,
    pub name: String,
    pub description: Option<String>,
    pub points_required: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = rewards)]
pub struct NewReward<'a> {
    pub family_id: &'a str,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub points_required: i64,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = redemptions)]
#[diesel(belongs_to(User, foreign_key = user_id))]
#[diesel(belongs_to(Reward, foreign_key = reward_id))]
pub struct Redemption {
    pub id: i32,
    pub user_id: String,
    pub reward_id: i32,
    pub points_spent: i64,
    pub redeemed_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = redemptions)]
pub struct NewRedemption<'a> {
    pub user_id: &'a str,
    pub reward_id: i32,
    pub points_spent: i64,
}

use crate::storage::schema::sessions;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = sessions)]
#[diesel(primary_key(jti))]
pub struct Session {
    pub jti: String,
    pub username: String,
    pub issued_at: NaiveDateTime,
    pub last_used_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = sessions)]
pub struct NewSession<'a> {
    pub jti: &'a str,
    pub username: &'a str,
}
