use super::{AppError, AppState, auth::AuthCtx};
use axum::response::Response;
use axum::{
    extract::{OriginalUri, State},
    http::{Method, Request},
    middleware::Next,
};
use fampoints_shared::auth::Role;
use fampoints_shared::domain::UserId;
use fampoints_shared::jwt::JwtClaims;
use percent_encoding::percent_decode_str;

pub async fn enforce_acl(
    State(_state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|orig| orig.0.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let method = req.method().clone();
    let Some(auth) = req.extensions().get::<AuthCtx>() else {
        return Err(AppError::unauthorized());
    };
    let claims = &auth.claims;

    let segs = segmented(&path);
    let rest = match scoped_rest(&segs, claims) {
        Ok(rest) => rest,
        Err(err) => {
            tracing::warn!(
                ?segs,
                username = %claims.sub,
                token_family = %claims.family_id,
                "ACL: path outside the caller's family scope"
            );
            return Err(err);
        }
    };

    let decision = match claims.role {
        Role::Parent => allow_parent(&method, rest),
        Role::Child => allow_child(&method, rest, claims),
    };

    if let Err(err) = decision {
        tracing::warn!(
            method = %method,
            path = %path,
            username = %claims.sub,
            role = ?claims.role,
            token_user = %claims.user_id,
            "ACL: no rule matched; denying"
        );
        return Err(err);
    }

    Ok(next.run(req).await)
}

/// Strips the `/api/v1/family/{family_id}` prefix, rejecting paths outside
/// the caller's own family. This is the family-scope half of the guard; the
/// per-role rules below decide the rest.
fn scoped_rest<'a>(segs: &'a [&'a str], claims: &JwtClaims) -> Result<&'a [&'a str], AppError> {
    let scope_prefix = ["api", "v1", "family"];
    if !segs.starts_with(&scope_prefix) {
        return Err(AppError::forbidden());
    }
    let Some(seg) = segs.get(3) else {
        return Err(AppError::forbidden());
    };
    if decode(seg) != claims.family_id.0 {
        return Err(AppError::forbidden());
    }
    Ok(&segs[4..])
}

fn allow_parent(method: &Method, rest: &[&str]) -> Result<(), AppError> {
    match rest {
        ["members"] if *method == Method::GET => Ok(()),
        ["members", _, "points"] if *method == Method::GET || *method == Method::POST => Ok(()),
        ["members", _, "ledger"] if *method == Method::GET => Ok(()),
        ["members", _, "redemptions"] if *method == Method::GET => Ok(()),
        ["rewards"] if *method == Method::GET || *method == Method::POST => Ok(()),
        ["rewards", id, "redeem"] if *method == Method::POST && id.parse::<i32>().is_ok() => {
            Ok(())
        }
        _ => Err(AppError::forbidden()),
    }
}

fn allow_child(method: &Method, rest: &[&str], claims: &JwtClaims) -> Result<(), AppError> {
    match rest {
        ["members", user, "points"] if *method == Method::GET => ensure_self(claims, user),
        ["members", user, "ledger"] if *method == Method::GET => ensure_self(claims, user),
        ["members", user, "redemptions"] if *method == Method::GET => ensure_self(claims, user),
        ["rewards"] if *method == Method::GET => Ok(()),
        ["rewards", id, "redeem"] if *method == Method::POST && id.parse::<i32>().is_ok() => {
            Ok(())
        }
        _ => Err(AppError::forbidden()),
    }
}

fn segmented(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn decode(seg: &str) -> String {
    percent_decode_str(seg).decode_utf8_lossy().to_string()
}

fn ensure_self(claims: &JwtClaims, seg: &str) -> Result<(), AppError> {
    let provided = UserId(decode(seg));
    if claims.user_id == provided {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}
