//! Request pieces shared by the API handlers.

use crate::auth::Credentials;
use crate::errors::DsError;
use crate::models::api::CredentialQuery;
use axum::http::HeaderMap;
use common::types::ParticipantId;
use serde::de::DeserializeOwned;

pub const INVITATION_TOKEN_HEADER: &str = "x-invitation-token";
pub const PARTICIPANT_ID_HEADER: &str = "x-participant-id";

/// Deserialize a JSON body, answering 400 instead of axum's 422.
pub fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, DsError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(target: "ds.handlers", error = %e, "Invalid request body");
        DsError::BadRequest("Invalid request body".to_string())
    })
}

/// Like [`parse_json`], but an empty body means `T::default()`.
pub fn parse_json_or_default<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, DsError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_json(body)
}

/// Anonymous credentials from headers, falling back to query parameters.
///
/// EventSource cannot set headers, so the stream endpoint relies on the
/// query form.
pub fn credentials(headers: &HeaderMap, query: CredentialQuery) -> Result<Credentials, DsError> {
    let token = header_str(headers, INVITATION_TOKEN_HEADER).map(str::to_string);

    let participant_id = match header_str(headers, PARTICIPANT_ID_HEADER) {
        Some(raw) => Some(raw.parse::<ParticipantId>().map_err(|_| {
            DsError::BadRequest("Invalid X-Participant-Id header".to_string())
        })?),
        None => None,
    };

    Ok(Credentials {
        token: token.or(query.token),
        participant_id: participant_id.or(query.participant_id),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::api::{AcceptInvitationRequest, SendMessageRequest};
    use axum::http::HeaderValue;

    #[test]
    fn test_headers_take_precedence_over_query() {
        let header_participant = ParticipantId::new();
        let mut headers = HeaderMap::new();
        headers.insert(INVITATION_TOKEN_HEADER, HeaderValue::from_static("from-header"));
        headers.insert(
            PARTICIPANT_ID_HEADER,
            HeaderValue::from_str(&header_participant.to_string()).unwrap(),
        );

        let creds = credentials(
            &headers,
            CredentialQuery {
                token: Some("from-query".to_string()),
                participant_id: Some(ParticipantId::new()),
            },
        )
        .unwrap();

        assert_eq!(creds.token.as_deref(), Some("from-header"));
        assert_eq!(creds.participant_id, Some(header_participant));
    }

    #[test]
    fn test_query_fills_in_missing_headers() {
        let participant = ParticipantId::new();
        let creds = credentials(
            &HeaderMap::new(),
            CredentialQuery {
                token: Some("tok".to_string()),
                participant_id: Some(participant),
            },
        )
        .unwrap();

        assert_eq!(creds.token.as_deref(), Some("tok"));
        assert_eq!(creds.participant_id, Some(participant));
    }

    #[test]
    fn test_malformed_participant_header_is_bad_request() {
        let mut headers = HeaderMap::new();
        headers.insert(PARTICIPANT_ID_HEADER, HeaderValue::from_static("not-a-uuid"));

        assert!(matches!(
            credentials(&headers, CredentialQuery::default()),
            Err(DsError::BadRequest(_))
        ));
    }

    #[test]
    fn test_parse_json_rejects_garbage_with_bad_request() {
        let result: Result<SendMessageRequest, _> = parse_json(b"{not json");
        assert!(matches!(result, Err(DsError::BadRequest(_))));
    }

    #[test]
    fn test_empty_body_is_default() {
        let request: AcceptInvitationRequest = parse_json_or_default(b"").unwrap();
        assert!(request.display_name.is_none());
        assert!(request.new_account.is_none());
    }
}
