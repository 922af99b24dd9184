use serde::{Deserialize, Serialize};

pub mod endpoints;

use crate::auth::Role;

pub const API_V1_PREFIX: &str = "/api/v1";

/// Path prefix shared by every family-scoped route.
pub fn family_scope(family_id: &str) -> String {
    format!("{}/family/{}", API_V1_PREFIX, family_id)
}

// Auth
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthReq {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResp {
    pub token: String,
}

// Family members
#[derive(Debug, Serialize, Deserialize)]
pub struct MemberDto {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    pub total_points: i64,
}

// Points & ledger
#[derive(Debug, Serialize, Deserialize)]
pub struct LedgerEntryDto {
    pub points: i64,
    pub reason: String,
    pub created_at: String, // RFC3339 UTC
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PointsDto {
    pub user_id: String,
    pub total_points: i64,
    pub recent: Vec<LedgerEntryDto>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreditReq {
    pub points: i64,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreditResp {
    pub user_id: String,
    pub total_points: i64,
}

// Rewards
#[derive(Debug, Serialize, Deserialize)]
pub struct RewardDto {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub points_required: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRewardReq {
    pub name: String,
    pub description: Option<String>,
    pub points_required: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RedeemResp {
    pub reward_id: i32,
    pub points_spent: i64,
    pub total_points: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RedemptionDto {
    pub reward_name: Option<String>,
    pub points_spent: i64,
    pub redeemed_at: String, // RFC3339 UTC
}
