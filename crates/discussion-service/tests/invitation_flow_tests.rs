//! Invitation flow over HTTP.
//!
//! Covers link creation and rotation, public validation, anonymous
//! acceptance, email invitations through the recording notifier, and
//! decline.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use ds_test_utils::TestDsServer;
use serde_json::{json, Value};

async fn create_link(
    server: &TestDsServer,
    client: &reqwest::Client,
    discussion_id: impl std::fmt::Display,
    session: &str,
    body: Value,
) -> Value {
    let response = client
        .post(server.api(&format!("/discussions/{discussion_id}/invitation-link")))
        .bearer_auth(session)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    response.json().await.unwrap()
}

fn token_of(link: &Value) -> String {
    link["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_link_accept_admits_anonymous_participant() -> Result<(), anyhow::Error> {
    let server = TestDsServer::spawn().await?;
    let client = reqwest::Client::new();
    let seeded = server.seed_discussion(Some(10)).await;

    let link = create_link(
        &server,
        &client,
        seeded.discussion.id,
        &seeded.owner_session,
        json!({ "ttlDays": 7 }),
    )
    .await;
    let token = token_of(&link);
    assert!(link["url"].as_str().unwrap().ends_with(&format!("/invite/{token}")));

    let validity: Value = client
        .get(server.api(&format!("/invite/{token}/validate")))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(validity["valid"], true);
    assert_eq!(validity["discussion"]["participantCount"], 1);

    let response = client
        .post(server.api(&format!("/invite/{token}/accept")))
        .json(&json!({ "displayName": "Alice", "sessionId": "browser-1" }))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let joined: Value = response.json().await?;
    assert_eq!(joined["participant"]["kind"], "anonymous");
    assert_eq!(joined["participant"]["displayName"], "Alice");
    assert_eq!(joined["newlyJoined"], true);
    assert_eq!(joined["discussion"]["participantCount"], 2);

    Ok(())
}

#[tokio::test]
async fn test_rotated_link_stops_validating() -> Result<(), anyhow::Error> {
    let server = TestDsServer::spawn().await?;
    let client = reqwest::Client::new();
    let seeded = server.seed_discussion(None).await;

    let first = token_of(
        &create_link(&server, &client, seeded.discussion.id, &seeded.owner_session, json!({})).await,
    );
    let second = token_of(
        &create_link(&server, &client, seeded.discussion.id, &seeded.owner_session, json!({})).await,
    );
    assert_ne!(first, second);

    let old: Value = client
        .get(server.api(&format!("/invite/{first}/validate")))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(old["valid"], false);
    assert_eq!(old["reason"], "INVITATION_REVOKED_OR_CANCELLED");

    let response = client
        .post(server.api(&format!("/invite/{first}/accept")))
        .json(&json!({ "displayName": "Late Larry", "sessionId": "browser-9" }))
        .send()
        .await?;
    assert_eq!(response.status(), 410);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "INVITATION_REVOKED_OR_CANCELLED");

    let current: Value = client
        .get(server.api(&format!("/invite/{second}/validate")))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(current["valid"], true);

    Ok(())
}

#[tokio::test]
async fn test_only_managers_create_links() -> Result<(), anyhow::Error> {
    let server = TestDsServer::spawn().await?;
    let client = reqwest::Client::new();
    let seeded = server.seed_discussion(None).await;
    let (_, stranger_session) = server.sign_up("stranger@example.com", "Stranger").await;

    let anonymous = client
        .post(server.api(&format!("/discussions/{}/invitation-link", seeded.discussion.id)))
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(anonymous.status(), 401);

    let stranger = client
        .post(server.api(&format!("/discussions/{}/invitation-link", seeded.discussion.id)))
        .bearer_auth(&stranger_session)
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(stranger.status(), 403);

    Ok(())
}

#[tokio::test]
async fn test_email_invitation_round_trip() -> Result<(), anyhow::Error> {
    let server = TestDsServer::spawn().await?;
    let client = reqwest::Client::new();
    let seeded = server.seed_discussion(None).await;

    let response = client
        .post(server.api(&format!("/discussions/{}/invitations", seeded.discussion.id)))
        .bearer_auth(&seeded.owner_session)
        .json(&json!({
            "recipients": ["Bea@Example.com", "bea@example.com", "not-an-email"],
            "ttlDays": 3
        }))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let sent: Value = response.json().await?;
    assert_eq!(sent["sent"], 1);
    let statuses: Vec<&str> = sent["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["sent", "invalid_email"]);

    let delivery = server
        .notifier()
        .last_for("bea@example.com")
        .expect("delivery should be recorded");
    let token = delivery.url.rsplit('/').next().unwrap().to_string();

    let lookup: Value = client
        .get(server.api(&format!("/invite/{token}")))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(lookup["valid"], true);
    assert_eq!(lookup["kind"], "EMAIL");
    assert_eq!(lookup["recipientEmail"], "bea@example.com");

    let listed: Value = client
        .get(server.api(&format!(
            "/invitations?discussionId={}",
            seeded.discussion.id
        )))
        .bearer_auth(&seeded.owner_session)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(listed["total"], 1);

    let declined = client
        .post(server.api(&format!("/invite/{token}/decline")))
        .send()
        .await?;
    assert_eq!(declined.status(), 200);
    let declined: Value = declined.json().await?;
    assert_eq!(declined["status"], "DECLINED");

    let after: Value = client
        .get(server.api(&format!("/invite/{token}/validate")))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(after["valid"], false);
    assert_eq!(after["reason"], "INVITATION_REVOKED_OR_CANCELLED");

    Ok(())
}

#[tokio::test]
async fn test_garbage_token_reports_token_invalid() -> Result<(), anyhow::Error> {
    let server = TestDsServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .post(server.api("/invite/definitely-not-a-token/accept"))
        .json(&json!({ "displayName": "Mallory", "sessionId": "m-1" }))
        .send()
        .await?;
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "TOKEN_INVALID");
    assert_eq!(body["error"]["reason"], "malformed");

    Ok(())
}

#[tokio::test]
async fn test_accepted_email_invitation_turns_away_other_browsers() -> Result<(), anyhow::Error> {
    let server = TestDsServer::spawn().await?;
    let client = reqwest::Client::new();
    let seeded = server.seed_discussion(None).await;

    client
        .post(server.api(&format!("/discussions/{}/invitations", seeded.discussion.id)))
        .bearer_auth(&seeded.owner_session)
        .json(&json!({ "recipients": ["cam@example.com"] }))
        .send()
        .await?;
    let delivery = server.notifier().last_for("cam@example.com").unwrap();
    let token = delivery.url.rsplit('/').next().unwrap().to_string();
    let accept_as = |session: &'static str| {
        client
            .post(server.api(&format!("/invite/{token}/accept")))
            .json(&json!({ "displayName": "Cam", "sessionId": session }))
            .send()
    };

    assert_eq!(accept_as("cam-laptop").await?.status(), 200);
    // Same browser again is a rejoin
    assert_eq!(accept_as("cam-laptop").await?.status(), 200);

    let forwarded = accept_as("someone-else").await?;
    assert_eq!(forwarded.status(), 410);
    let body: Value = forwarded.json().await?;
    assert_eq!(body["error"]["code"], "INVITATION_REVOKED_OR_CANCELLED");

    Ok(())
}

#[tokio::test]
async fn test_sign_up_into_full_discussion_can_be_retried() -> Result<(), anyhow::Error> {
    let server = TestDsServer::spawn().await?;
    let client = reqwest::Client::new();
    // The owner takes the only seat
    let seeded = server.seed_discussion(Some(1)).await;
    let link = create_link(
        &server,
        &client,
        seeded.discussion.id,
        &seeded.owner_session,
        json!({}),
    )
    .await;
    let token = token_of(&link);

    for _ in 0..2 {
        let response = client
            .post(server.api(&format!("/invite/{token}/accept")))
            .json(&json!({
                "newAccount": {
                    "email": "dana@example.com",
                    "displayName": "Dana",
                    "password": "correct horse"
                }
            }))
            .send()
            .await?;
        assert_eq!(response.status(), 409);
        let body: Value = response.json().await?;
        assert_eq!(body["error"]["code"], "DISCUSSION_FULL");
    }

    Ok(())
}
