use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

use super::{API_V1_PREFIX, family_scope};

fn base_join(base: &str, path: &str) -> String {
    let b = base.trim_end_matches('/');
    let p = path.trim_start_matches('/');
    format!("{}/{}", b, p)
}

fn enc(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

pub fn auth_login(base: &str) -> String {
    base_join(base, &format!("{}/auth/login", API_V1_PREFIX))
}
pub fn members(base: &str, family_id: &str) -> String {
    base_join(base, &format!("{}/members", family_scope(family_id)))
}
pub fn member_points(base: &str, family_id: &str, user_id: &str) -> String {
    base_join(
        base,
        &format!(
            "{}/members/{}/points",
            family_scope(family_id),
            enc(user_id)
        ),
    )
}
pub fn member_ledger(base: &str, family_id: &str, user_id: &str) -> String {
    base_join(
        base,
        &format!(
            "{}/members/{}/ledger",
            family_scope(family_id),
            enc(user_id)
        ),
    )
}
pub fn member_redemptions(base: &str, family_id: &str, user_id: &str) -> String {
    base_join(
        base,
        &format!(
            "{}/members/{}/redemptions",
            family_scope(family_id),
            enc(user_id)
        ),
    )
}
pub fn rewards(base: &str, family_id: &str) -> String {
    base_join(base, &format!("{}/rewards", family_scope(family_id)))
}
pub fn reward_redeem(base: &str, family_id: &str, reward_id: i32) -> String {
    base_join(
        base,
        &format!(
            "{}/rewards/{}/redeem",
            family_scope(family_id),
            reward_id
        ),
    )
}
