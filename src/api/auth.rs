// =============================================================================
// Bearer Token Authentication — Axum extractors
// =============================================================================
//
// Generalized from the teacher's static `AURORA_ADMIN_TOKEN` bearer extractor
// into one that decodes a JWT issued by the Session Gateway and yields a
// `Principal { user_id, role }`. `AdminPrincipal` layers an additional role
// check on top, for the `/admin/*` routes (spec.md §6).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use uuid::Uuid;

use crate::app_state::AppState;
use crate::types::Role;

pub struct Principal {
    pub user_id: Uuid,
    pub role: Role,
}

impl Principal {
    pub fn is_owner_or_admin(&self, owner_id: Uuid) -> bool {
        self.user_id == owner_id || self.role.is_admin()
    }
}

/// `Principal` that has already passed the admin-role check.
pub struct AdminPrincipal(pub Principal);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "success": false, "data": null, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// Pulls the raw token out of `Authorization: Bearer <token>`, or `None` if
/// the header is missing or malformed.
fn parse_bearer(header: Option<&str>) -> Option<&str> {
    header.and_then(|v| v.strip_prefix("Bearer "))
}

impl FromRequestParts<Arc<AppState>> for Principal {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let token = parse_bearer(header).ok_or(AuthRejection {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or malformed Authorization header",
        })?;

        let claims = state
            .session_gateway
            .decode_access_token(token)
            .map_err(|_| AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "invalid or expired access token",
            })?;

        Ok(Principal {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}

impl FromRequestParts<Arc<AppState>> for AdminPrincipal {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let principal = Principal::from_request_parts(parts, state).await?;
        if !principal.role.is_admin() {
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "admin role required",
            });
        }
        Ok(AdminPrincipal(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bearer_strips_prefix() {
        assert_eq!(parse_bearer(Some("Bearer abc123")), Some("abc123"));
    }

    #[test]
    fn parse_bearer_rejects_missing_prefix() {
        assert_eq!(parse_bearer(Some("abc123")), None);
    }

    #[test]
    fn parse_bearer_rejects_missing_header() {
        assert_eq!(parse_bearer(None), None);
    }

    #[test]
    fn owner_or_admin_allows_owner() {
        let owner = Uuid::new_v4();
        let principal = Principal {
            user_id: owner,
            role: Role::Trader,
        };
        assert!(principal.is_owner_or_admin(owner));
        assert!(!principal.is_owner_or_admin(Uuid::new_v4()));
    }

    #[test]
    fn owner_or_admin_allows_admin_for_any_owner() {
        let principal = Principal {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        assert!(principal.is_owner_or_admin(Uuid::new_v4()));
    }
}
