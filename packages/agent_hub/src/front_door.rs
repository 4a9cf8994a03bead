//! Admission for `GET /ws`: identity first, then parameter validation,
//! all before the WebSocket upgrade.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

use crate::auth::{AuthError, IdentityValidator, check_identity};
use crate::config::SessionConfig;
use crate::params::{Model, SpawnParams, SpawnRequest};
use crate::session_actor::Geometry;

/// Raw query parameters, kept as strings so identity is checked before
/// anything else is parsed.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub token: Option<String>,
    pub session_id: Option<String>,
    pub cols: Option<String>,
    pub rows: Option<String>,
    pub cwd: Option<String>,
    pub command: Option<String>,
    pub resume_session_id: Option<String>,
    pub bypass_permissions: Option<String>,
    pub verbose: Option<String>,
    pub model: Option<String>,
}

/// A validated attach request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedConnection {
    pub session_id: String,
    pub geometry: Option<Geometry>,
    /// Used only if the session does not exist yet
    pub spawn: SpawnParams,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrontDoorError {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("sessionId is required")]
    MissingSessionId,
    #[error("invalid {name}: {value:?}")]
    InvalidParameter { name: &'static str, value: String },
}

impl IntoResponse for FrontDoorError {
    fn into_response(self) -> Response {
        match self {
            FrontDoorError::Unauthorized(e) => e.into_response(),
            other => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": other.to_string() })),
            )
                .into_response(),
        }
    }
}

pub fn admit(
    params: ConnectParams,
    validator: &dyn IdentityValidator,
    defaults: &SessionConfig,
) -> Result<AdmittedConnection, FrontDoorError> {
    check_identity(validator, params.token.as_deref())?;

    let session_id = params
        .session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(FrontDoorError::MissingSessionId)?;

    let cols = parse_dimension("cols", params.cols)?;
    let rows = parse_dimension("rows", params.rows)?;
    let geometry = match (cols, rows) {
        (None, None) => None,
        (cols, rows) => Some(Geometry {
            cols: cols.unwrap_or(defaults.default_cols),
            rows: rows.unwrap_or(defaults.default_rows),
        }),
    };

    let model = match blank_to_none(params.model) {
        Some(value) => Some(
            Model::from_str(&value)
                .map_err(|_| FrontDoorError::InvalidParameter { name: "model", value })?,
        ),
        None => None,
    };

    let spawn = SpawnRequest {
        command: params.command,
        cwd: params.cwd,
        resume_id: params.resume_session_id,
        bypass_permissions: Some(parse_flag("bypassPermissions", params.bypass_permissions)?),
        verbose: Some(parse_flag("verbose", params.verbose)?),
        model,
    }
    .resolve(defaults);

    Ok(AdmittedConnection {
        session_id,
        geometry,
        spawn,
    })
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_dimension(name: &'static str, value: Option<String>) -> Result<Option<u16>, FrontDoorError> {
    let Some(value) = blank_to_none(value) else {
        return Ok(None);
    };
    match value.trim().parse::<u16>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(FrontDoorError::InvalidParameter { name, value }),
    }
}

fn parse_flag(name: &'static str, value: Option<String>) -> Result<bool, FrontDoorError> {
    let Some(value) = blank_to_none(value) else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(FrontDoorError::InvalidParameter { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, TokenListValidator};

    fn validator() -> TokenListValidator {
        TokenListValidator::new(["tok".to_string()])
    }

    fn base() -> ConnectParams {
        ConnectParams {
            token: Some("tok".into()),
            session_id: Some("s1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn identity_is_checked_before_parameters() {
        let params = ConnectParams {
            token: None,
            session_id: None,
            cols: Some("wide".into()),
            ..Default::default()
        };
        assert_eq!(
            admit(params, &validator(), &SessionConfig::for_tests()).unwrap_err(),
            FrontDoorError::Unauthorized(AuthError::MissingToken)
        );

        let params = ConnectParams {
            token: Some("wrong".into()),
            ..base()
        };
        assert_eq!(
            admit(params, &validator(), &SessionConfig::for_tests()).unwrap_err(),
            FrontDoorError::Unauthorized(AuthError::InvalidToken)
        );
    }

    #[test]
    fn blank_session_id_is_rejected() {
        let params = ConnectParams {
            session_id: Some("   ".into()),
            ..base()
        };
        assert_eq!(
            admit(params, &validator(), &SessionConfig::for_tests()).unwrap_err(),
            FrontDoorError::MissingSessionId
        );
    }

    #[test]
    fn defaults_fill_in_spawn_params() {
        let defaults = SessionConfig::for_tests();
        let admitted = admit(base(), &validator(), &defaults).unwrap();
        assert_eq!(admitted.session_id, "s1");
        assert_eq!(admitted.geometry, None);
        assert_eq!(admitted.spawn.command, defaults.default_command);
        assert_eq!(admitted.spawn.cwd, defaults.default_cwd);
        assert!(admitted.spawn.agent_args().is_empty());
    }

    #[test]
    fn full_query_is_translated() {
        let params = ConnectParams {
            cols: Some("120".into()),
            rows: Some("40".into()),
            cwd: Some("/work".into()),
            command: Some("claude".into()),
            resume_session_id: Some("abc".into()),
            bypass_permissions: Some("true".into()),
            verbose: Some("1".into()),
            model: Some("Opus".into()),
            ..base()
        };
        let admitted = admit(params, &validator(), &SessionConfig::for_tests()).unwrap();
        assert_eq!(admitted.geometry, Some(Geometry { cols: 120, rows: 40 }));
        assert_eq!(admitted.spawn.cwd, "/work");
        assert_eq!(
            admitted.spawn.agent_args(),
            vec![
                "--resume",
                "abc",
                "--dangerously-skip-permissions",
                "--verbose",
                "--model",
                "opus"
            ]
        );
    }

    #[test]
    fn malformed_geometry_and_flags_are_rejected() {
        for params in [
            ConnectParams {
                cols: Some("0".into()),
                ..base()
            },
            ConnectParams {
                rows: Some("-3".into()),
                ..base()
            },
            ConnectParams {
                cols: Some("70000".into()),
                ..base()
            },
            ConnectParams {
                verbose: Some("maybe".into()),
                ..base()
            },
            ConnectParams {
                model: Some("gpt".into()),
                ..base()
            },
        ] {
            assert!(matches!(
                admit(params, &validator(), &SessionConfig::for_tests()),
                Err(FrontDoorError::InvalidParameter { .. })
            ));
        }
    }

    #[test]
    fn open_mode_refuses_a_missing_token() {
        let params = ConnectParams {
            token: None,
            ..base()
        };
        assert_eq!(
            admit(params, &AllowAll, &SessionConfig::for_tests()).unwrap_err(),
            FrontDoorError::Unauthorized(AuthError::MissingToken)
        );
    }

    #[test]
    fn partial_geometry_uses_default_for_the_other_side() {
        let params = ConnectParams {
            cols: Some("100".into()),
            ..base()
        };
        let admitted = admit(params, &AllowAll, &SessionConfig::for_tests()).unwrap();
        assert_eq!(admitted.geometry, Some(Geometry { cols: 100, rows: 24 }));
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            FrontDoorError::Unauthorized(AuthError::MissingToken)
                .into_response()
                .status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            FrontDoorError::MissingSessionId.into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
