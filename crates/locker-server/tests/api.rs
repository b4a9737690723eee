//! End-to-end tests of the HTTP API over in-memory tenants.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use locker_core::auth::JwtKeys;
use locker_core::billing::{ManualGateway, PaymentGateway};
use locker_core::crypto::EncryptionKey;
use locker_core::{Locker, LockerSettings, TenantRouter};
use locker_server::middleware::{ADMIN_TOKEN_HEADER, RELAY_SECRET_HEADER, TENANT_HEADER};
use locker_server::state::AppState;
use locker_storage::MemoryBackend;

const RELAY_SECRET: &str = "relay-hook-secret";
const ADMIN_TOKEN: &str = "operator-token";

struct TestApp {
    router: Router,
}

impl TestApp {
    fn new() -> Self {
        Self::with_secrets(Some(RELAY_SECRET), Some(ADMIN_TOKEN))
    }

    fn with_secrets(relay_secret: Option<&str>, admin_token: Option<&str>) -> Self {
        let master = EncryptionKey::generate();
        let jwt = Arc::new(JwtKeys::new(&[7u8; 32]).unwrap());
        let gateway: Arc<dyn PaymentGateway> = Arc::new(ManualGateway);
        let settings = LockerSettings {
            relay_domain: "relay.test".to_owned(),
            ..LockerSettings::default()
        };

        let mut tenants = TenantRouter::new("main").unwrap();
        for alias in ["main", "eu"] {
            let locker = Locker::open(
                alias,
                Arc::new(MemoryBackend::new()),
                &master,
                Arc::clone(&jwt),
                Arc::clone(&gateway),
                &settings,
            )
            .unwrap();
            tenants.register(locker).unwrap();
        }

        let state = Arc::new(AppState {
            tenants,
            jwt,
            relay_secret: relay_secret.map(str::to_owned),
            admin_token: admin_token.map(str::to_owned),
        });
        Self {
            router: locker_server::build_router(state, 64),
        }
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>, headers: &[(&str, &str)]) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        let bearer = format!("Bearer {token}");
        self.call("GET", uri, None, &[("authorization", bearer.as_str())]).await
    }

    async fn send(&self, method: &str, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        let bearer = format!("Bearer {token}");
        self.call(method, uri, Some(body), &[("authorization", bearer.as_str())]).await
    }

    async fn register(&self, tenant: &str, email: &str) {
        let (status, body) = self
            .call(
                "POST",
                "/api/accounts/register",
                Some(json!({
                    "email": email,
                    "master_password_hash": format!("hash-of-{email}"),
                    "key": "2.account-key",
                    "public_key": "pub",
                    "encrypted_private_key": "2.priv",
                })),
                &[(TENANT_HEADER, tenant)],
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
    }

    async fn login(&self, tenant: &str, email: &str) -> String {
        let (status, body) = self
            .call(
                "POST",
                "/api/auth/login",
                Some(json!({
                    "email": email,
                    "master_password_hash": format!("hash-of-{email}"),
                })),
                &[(TENANT_HEADER, tenant)],
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["access_token"].as_str().unwrap().to_owned()
    }

    async fn signup(&self, email: &str) -> String {
        self.register("main", email).await;
        self.login("main", email).await
    }
}

fn login_cipher(name: &str) -> Value {
    json!({"kind": "login", "data": {"name": name}})
}

#[tokio::test]
async fn health_lists_tenants() {
    let app = TestApp::new();
    let (status, body) = app.call("GET", "/api/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["tenants"], 2);
}

#[tokio::test]
async fn register_login_and_sync() {
    let app = TestApp::new();
    app.register("main", "alice@example.com").await;

    let (status, kdf) = app
        .call(
            "POST",
            "/api/accounts/prelogin",
            Some(json!({"email": "alice@example.com"})),
            &[],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(kdf["iterations"].as_u64().unwrap() > 0);

    let token = app.login("main", "alice@example.com").await;
    let (status, sync) = app.get("/api/sync", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sync["profile"]["email"], "alice@example.com");
    assert_eq!(sync["ciphers"].as_array().unwrap().len(), 0);
    assert_eq!(sync["premium"], false);
}

#[tokio::test]
async fn duplicate_registration_conflicts() {
    let app = TestApp::new();
    app.register("main", "alice@example.com").await;
    let (status, body) = app
        .call(
            "POST",
            "/api/accounts/register",
            Some(json!({
                "email": "Alice@Example.com",
                "master_password_hash": "other",
                "key": "2.k",
            })),
            &[],
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn wrong_password_is_unauthorized() {
    let app = TestApp::new();
    app.register("main", "alice@example.com").await;
    let (status, _) = app
        .call(
            "POST",
            "/api/auth/login",
            Some(json!({"email": "alice@example.com", "master_password_hash": "nope"})),
            &[],
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_or_bad_token_is_unauthorized() {
    let app = TestApp::new();
    let (status, _) = app.call("GET", "/api/sync", None, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.get("/api/sync", "not-a-jwt").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn security_headers_are_set() {
    let app = TestApp::new();
    let request = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["cache-control"], "no-store");
}

#[tokio::test]
async fn cipher_lifecycle() {
    let app = TestApp::new();
    let token = app.signup("alice@example.com").await;

    let (status, folder) = app.send("POST", "/api/folders", &token, json!({"name": "2.work"})).await;
    assert_eq!(status, StatusCode::CREATED);
    let folder_id = folder["id"].as_str().unwrap().to_owned();

    let (status, cipher) = app.send("POST", "/api/ciphers", &token, login_cipher("2.bank")).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = cipher["id"].as_str().unwrap().to_owned();
    assert_eq!(cipher["owner"]["kind"], "user");

    let (status, updated) = app
        .send(
            "PUT",
            &format!("/api/ciphers/{id}"),
            &token,
            json!({"kind": "login", "data": {"name": "2.bank-renamed"}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["data"]["name"], "2.bank-renamed");

    let (status, _) = app
        .send(
            "POST",
            "/api/ciphers/move",
            &token,
            json!({"cipher_ids": [id], "folder_id": folder_id}),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, fetched) = app.get(&format!("/api/ciphers/{id}"), &token).await;
    assert_eq!(fetched["folder_id"], folder_id.as_str());

    let (status, _) = app.send("POST", &format!("/api/ciphers/{id}/trash"), &token, json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, trashed) = app.get(&format!("/api/ciphers/{id}"), &token).await;
    assert!(trashed["deleted_at"].is_string());

    let (status, restored) = app.send("POST", &format!("/api/ciphers/{id}/restore"), &token, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(restored["deleted_at"].is_null());

    let bearer = format!("Bearer {token}");
    let (status, _) = app
        .call("DELETE", &format!("/api/ciphers/{id}"), None, &[("authorization", bearer.as_str())])
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.get(&format!("/api/ciphers/{id}"), &token).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, events) = app.get("/api/accounts/events", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert!(events["events"].as_array().unwrap().len() >= 5);
}

#[tokio::test]
async fn ciphers_are_private_to_their_owner() {
    let app = TestApp::new();
    let alice = app.signup("alice@example.com").await;
    let bob = app.signup("bob@example.com").await;

    let (_, cipher) = app.send("POST", "/api/ciphers", &alice, login_cipher("2.secret")).await;
    let id = cipher["id"].as_str().unwrap();

    let (status, _) = app.get(&format!("/api/ciphers/{id}"), &bob).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, list) = app.get("/api/ciphers", &bob).await;
    assert!(list["ciphers"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn tenants_are_isolated() {
    let app = TestApp::new();
    app.register("main", "alice@example.com").await;
    // Same address, different tenant database.
    app.register("eu", "alice@example.com").await;

    let main_token = app.login("main", "alice@example.com").await;
    let eu_token = app.login("eu", "alice@example.com").await;

    app.send("POST", "/api/ciphers", &main_token, login_cipher("2.main-only")).await;

    let (_, eu_sync) = app.get("/api/sync", &eu_token).await;
    assert!(eu_sync["ciphers"].as_array().unwrap().is_empty());
    let (_, main_sync) = app.get("/api/sync", &main_token).await;
    assert_eq!(main_sync["ciphers"].as_array().unwrap().len(), 1);

    // A token cannot be redirected to another tenant.
    let bearer = format!("Bearer {eu_token}");
    let (status, _) = app
        .call("GET", "/api/sync", None, &[("authorization", bearer.as_str()), (TENANT_HEADER, "main")])
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_tenant_is_not_found() {
    let app = TestApp::new();
    let (status, _) = app
        .call(
            "POST",
            "/api/accounts/prelogin",
            Some(json!({"email": "a@example.com"})),
            &[(TENANT_HEADER, "apac")],
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .call(
            "POST",
            "/api/accounts/prelogin",
            Some(json!({"email": "a@example.com"})),
            &[(TENANT_HEADER, "Not Valid!")],
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn team_sharing_flow() {
    let app = TestApp::new();
    let alice = app.signup("alice@example.com").await;
    let bob = app.signup("bob@example.com").await;

    let (status, created) = app
        .send(
            "POST",
            "/api/teams",
            &alice,
            json!({"name": "Acme", "billing_email": "billing@acme.test", "owner_key": "4.team-key"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let team_id = created["team"]["id"].as_str().unwrap().to_owned();
    assert_eq!(created["member"]["role"], "owner");

    let (status, collection) = app
        .send(
            "POST",
            &format!("/api/teams/{team_id}/collections"),
            &alice,
            json!({"name": "2.engineering"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let collection_id = collection["id"].as_str().unwrap().to_owned();

    let (status, invited) = app
        .send(
            "POST",
            &format!("/api/teams/{team_id}/members"),
            &alice,
            json!({
                "email": "bob@example.com",
                "role": "member",
                "grants": [{"collection_id": collection_id, "read_only": true}],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{invited}");
    let member_id = invited["id"].as_str().unwrap().to_owned();

    // A free team has two seats, both now taken.
    let (status, _) = app
        .send(
            "POST",
            &format!("/api/teams/{team_id}/members"),
            &alice,
            json!({"email": "carol@example.com", "role": "member"}),
        )
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let (_, invitations) = app.get("/api/teams/invitations", &bob).await;
    assert_eq!(invitations["teams"].as_array().unwrap().len(), 1);

    let (status, _) = app
        .send(
            "POST",
            &format!("/api/teams/{team_id}/members/{member_id}/accept"),
            &bob,
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, confirmed) = app
        .send(
            "POST",
            &format!("/api/teams/{team_id}/members/{member_id}/confirm"),
            &alice,
            json!({"key": "4.team-key-for-bob"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "confirmed");

    let (status, shared) = app
        .send(
            "POST",
            "/api/ciphers",
            &alice,
            json!({
                "kind": "login",
                "data": {"name": "2.prod-db"},
                "team_id": team_id,
                "collection_ids": [collection_id],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{shared}");

    let (_, bob_ciphers) = app.get("/api/ciphers", &bob).await;
    let ciphers = bob_ciphers["ciphers"].as_array().unwrap();
    assert_eq!(ciphers.len(), 1);
    assert_eq!(ciphers[0]["edit"], false);

    // Members can read but not administer.
    let (status, _) = app.get(&format!("/api/teams/{team_id}/events"), &bob).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, events) = app.get(&format!("/api/teams/{team_id}/events"), &alice).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!events["events"].as_array().unwrap().is_empty());

    let (status, _) = app
        .send(
            "POST",
            &format!("/api/teams/{team_id}/billing/quote"),
            &bob,
            json!({"plan": "teams", "period": "monthly", "seats": 5, "method": "card"}),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn relay_aliases_and_inbound_routing() {
    let app = TestApp::new();
    let token = app.signup("alice@example.com").await;

    let (status, alias) = app.send("POST", "/api/relay/aliases", &token, json!({})).await;
    assert_eq!(status, StatusCode::CREATED, "{alias}");
    let address = alias["address"].as_str().unwrap().to_owned();
    assert!(address.ends_with("@relay.test"));

    // Custom local parts need premium.
    let (status, _) = app
        .send("POST", "/api/relay/aliases", &token, json!({"local_part": "shopping"}))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let inbound = json!({"recipient": address, "is_spam": false});
    let (status, _) = app.call("POST", "/api/relay/inbound", Some(inbound.clone()), &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, route) = app
        .call(
            "POST",
            "/api/relay/inbound",
            Some(inbound.clone()),
            &[(RELAY_SECRET_HEADER, RELAY_SECRET)],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(route["action"], "forward");
    assert_eq!(route["to"], "alice@example.com");

    let alias_id = alias["id"].as_str().unwrap();
    let (status, _) = app
        .send(
            "PUT",
            &format!("/api/relay/aliases/{alias_id}"),
            &token,
            json!({"enabled": false}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, route) = app
        .call("POST", "/api/relay/inbound", Some(inbound), &[(RELAY_SECRET_HEADER, RELAY_SECRET)])
        .await;
    assert_eq!(route["action"], "reject");

    let (_, listed) = app.get(&format!("/api/relay/aliases/{alias_id}"), &token).await;
    assert_eq!(listed["forwarded"], 1);
    assert_eq!(listed["blocked"], 1);
}

#[tokio::test]
async fn hooks_are_disabled_without_secrets() {
    let app = TestApp::with_secrets(None, None);
    let (status, _) = app
        .call(
            "POST",
            "/api/relay/inbound",
            Some(json!({"recipient": "x@relay.test"})),
            &[(RELAY_SECRET_HEADER, "anything")],
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .call("GET", "/api/admin/payments/pending", None, &[(ADMIN_TOKEN_HEADER, "anything")])
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn confirmed_upgrade_unlocks_emergency_access() {
    let app = TestApp::new();
    let alice = app.signup("alice@example.com").await;
    let invite = json!({"email": "bob@example.com", "kind": "view", "wait_days": 2});

    let (status, _) = app.send("POST", "/api/emergency/granted", &alice, invite.clone()).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let (status, payment) = app
        .send(
            "POST",
            "/api/billing/upgrade",
            &alice,
            json!({"plan": "premium", "period": "yearly", "method": "bank_transfer"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{payment}");
    assert_eq!(payment["status"], "pending");
    let payment_id = payment["id"].as_str().unwrap().to_owned();

    // Still free until an operator confirms.
    let (_, subscription) = app.get("/api/billing/subscription", &alice).await;
    assert_eq!(subscription["plan"], "free");
    assert_eq!(subscription["pending_payment"], payment_id.as_str());

    let confirm_uri = format!("/api/admin/payments/{payment_id}/confirm");
    let (status, _) = app.call("POST", &confirm_uri, None, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, pending) = app
        .call("GET", "/api/admin/payments/pending", None, &[(ADMIN_TOKEN_HEADER, ADMIN_TOKEN)])
        .await;
    assert_eq!(pending["payments"].as_array().unwrap().len(), 1);

    let (status, confirmed) = app
        .call("POST", &confirm_uri, None, &[(ADMIN_TOKEN_HEADER, ADMIN_TOKEN)])
        .await;
    assert_eq!(status, StatusCode::OK, "{confirmed}");
    assert_eq!(confirmed["plan"], "premium");

    let (status, grant) = app.send("POST", "/api/emergency/granted", &alice, invite).await;
    assert_eq!(status, StatusCode::CREATED, "{grant}");
    let grant_id = grant["id"].as_str().unwrap().to_owned();
    app.send("POST", "/api/ciphers", &alice, login_cipher("2.will")).await;

    let bob = app.signup("bob@example.com").await;
    let (_, trusted) = app.get("/api/emergency/trusted", &bob).await;
    assert_eq!(trusted["grants"].as_array().unwrap().len(), 1);

    // Viewing before approval is refused.
    let (status, _) = app.get(&format!("/api/emergency/{grant_id}/view"), &bob).await;
    assert_ne!(status, StatusCode::OK);

    let steps = [
        (&bob, "accept", json!({}), "accepted"),
        (&alice, "confirm", json!({"key": "4.alice-key-for-bob"}), "confirmed"),
        (&bob, "initiate", json!({}), "recovery_initiated"),
        (&alice, "approve", json!({}), "recovery_approved"),
    ];
    for (token, action, body, expected) in steps {
        let (status, grant) = app
            .send("POST", &format!("/api/emergency/{grant_id}/{action}"), token, body)
            .await;
        assert_eq!(status, StatusCode::OK, "{action}: {grant}");
        assert_eq!(grant["status"], expected);
    }

    let (status, view) = app.get(&format!("/api/emergency/{grant_id}/view"), &bob).await;
    assert_eq!(status, StatusCode::OK);
    let ciphers = view["ciphers"].as_array().unwrap();
    assert_eq!(ciphers.len(), 1);
    assert_eq!(ciphers[0]["data"]["name"], "2.will");

    // A view grant does not allow takeover.
    let (status, _) = app
        .send("POST", &format!("/api/emergency/{grant_id}/takeover"), &bob, json!({}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn rejected_payment_clears_pending_state() {
    let app = TestApp::new();
    let alice = app.signup("alice@example.com").await;
    let (_, payment) = app
        .send(
            "POST",
            "/api/billing/upgrade",
            &alice,
            json!({"plan": "premium", "period": "monthly", "method": "bank_transfer"}),
        )
        .await;
    let payment_id = payment["id"].as_str().unwrap();

    let (status, rejected) = app
        .call(
            "POST",
            &format!("/api/admin/payments/{payment_id}/reject"),
            Some(json!({"reason": "transfer never arrived"})),
            &[(ADMIN_TOKEN_HEADER, ADMIN_TOKEN)],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rejected["status"], "failed");

    let (_, subscription) = app.get("/api/billing/subscription", &alice).await;
    assert_eq!(subscription["plan"], "free");
    assert!(subscription["pending_payment"].is_null());

    let (status, _) = app
        .call(
            "POST",
            &format!("/api/admin/payments/{payment_id}/confirm"),
            None,
            &[(ADMIN_TOKEN_HEADER, ADMIN_TOKEN)],
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn admin_can_run_jobs() {
    let app = TestApp::new();
    let (status, body) = app
        .call(
            "POST",
            "/api/admin/jobs/run",
            None,
            &[(ADMIN_TOKEN_HEADER, ADMIN_TOKEN), (TENANT_HEADER, "eu")],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenant"], "eu");
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 6);
    assert!(jobs.iter().all(|j| j["error"].is_null()));
}

#[tokio::test]
async fn deleted_account_token_stops_working() {
    let app = TestApp::new();
    let token = app.signup("alice@example.com").await;
    let bearer = format!("Bearer {token}");

    let (status, _) = app
        .call(
            "DELETE",
            "/api/accounts",
            Some(json!({"master_password_hash": "wrong"})),
            &[("authorization", bearer.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(
            "DELETE",
            "/api/accounts",
            Some(json!({"master_password_hash": "hash-of-alice@example.com"})),
            &[("authorization", bearer.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app.get("/api/sync", &token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
