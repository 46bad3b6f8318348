// tests/api.rs

//! Wire-level scenarios against the daemon router.

mod common;

use common::{remote_snap, setup, Client};
use serde_json::json;
use snapd::hookstate::HookOutput;
use snapd::ifacestate::{self, PlugInfo, SlotInfo};
use snapd::store::StoreUserInfo;

#[tokio::test]
async fn test_install_async_flow() {
    let t = setup();

    let (status, body) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "install", "channel": "stable"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 202);
    assert_eq!(body["type"], "async");
    assert_eq!(body["status_code"], 202);
    let change_id = body["change"].as_str().unwrap().to_string();

    t.settle().await;

    let (status, body) = t
        .request(
            "GET",
            &format!("/v2/changes/{}", change_id),
            None,
            &Client::root(),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["status"], "Done");
    assert_eq!(body["result"]["ready"], true);
    assert_eq!(body["result"]["kind"], "install-snap");
    assert!(body["result"]["ready-time"].is_string());

    // the snap is now visible as installed and active
    let (status, body) = t
        .request("GET", "/v2/snaps/foo", None, &Client::root())
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["status"], "active");
    assert_eq!(body["result"]["revision"], 7);

    let (_, body) = t.request("GET", "/v2/snaps", None, &Client::root()).await;
    assert_eq!(body["sources"][0], "local");
    let names: Vec<&str> = body["result"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"foo"));
    // the base snap was bootstrapped alongside
    assert!(names.contains(&"core"));
}

#[tokio::test]
async fn test_login_rejects_non_email() {
    let t = setup();

    let (status, body) = t
        .request(
            "POST",
            "/v2/login",
            Some(json!({"username": "noat.example", "password": "x"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["type"], "error");
    assert_eq!(body["result"]["kind"], "invalid-auth-data");
    assert_eq!(body["result"]["value"]["email"][0], "invalid");
}

#[tokio::test]
async fn test_login_logout_round_trip() {
    let t = setup();

    let client = t.login(1000, "user@example.com", "secret").await;

    // a macaroon-bearing user may hit user-ok routes
    let (status, _) = t.request("GET", "/v2/snaps", None, &client).await;
    assert_eq!(status, 200);

    let (status, _) = t.request("POST", "/v2/logout", None, &client).await;
    assert_eq!(status, 200);

    // the record is gone, the macaroon no longer authenticates
    let (status, _) = t.request("GET", "/v2/snaps", None, &client).await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn test_login_bad_credentials() {
    let t = setup();

    let (status, _) = t
        .request(
            "POST",
            "/v2/login",
            Some(json!({"username": "user@example.com", "password": "wrong"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn test_interfaces_connect() {
    let t = setup();
    {
        let mut st = t.daemon.store.lock();
        ifacestate::add_plug(
            &mut st,
            PlugInfo {
                snap: "a".to_string(),
                plug: "p".to_string(),
                interface: "serial-port".to_string(),
                label: String::new(),
                attrs: serde_json::Map::new(),
            },
        );
        ifacestate::add_slot(
            &mut st,
            SlotInfo {
                snap: "b".to_string(),
                slot: "s".to_string(),
                interface: "serial-port".to_string(),
                label: String::new(),
                attrs: serde_json::Map::new(),
            },
        );
    }

    let (status, body) = t
        .request(
            "POST",
            "/v2/interfaces",
            Some(json!({
                "action": "connect",
                "plugs": [{"snap": "a", "plug": "p"}],
                "slots": [{"snap": "b", "slot": "s"}],
            })),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 202);
    let change_id = body["change"].as_str().unwrap().to_string();

    let (_, body) = t
        .request(
            "GET",
            &format!("/v2/changes/{}", change_id),
            None,
            &Client::root(),
        )
        .await;
    assert_eq!(body["result"]["kind"], "connect-snap");
    assert_eq!(body["result"]["summary"], "Connect a:p to b:s");
    assert_eq!(body["result"]["data"]["snap-names"], json!(["a", "b"]));

    t.settle().await;

    let (_, body) = t
        .request("GET", "/v2/interfaces", None, &Client::root())
        .await;
    assert_eq!(body["result"]["plugs"][0]["connections"][0]["snap"], "b");
}

#[tokio::test]
async fn test_devmode_jailmode_conflict() {
    let t = setup();

    let (status, body) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "install", "devmode": true, "jailmode": true})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["result"]["message"]
        .as_str()
        .unwrap()
        .contains("devmode and jailmode"));
}

#[tokio::test]
async fn test_changes_select_and_for() {
    let t = setup();
    t.snap_store.add_snap(remote_snap("bar", 3));

    for name in ["foo", "bar"] {
        let (status, _) = t
            .request(
                "POST",
                &format!("/v2/snaps/{}", name),
                Some(json!({"action": "install"})),
                &Client::root(),
            )
            .await;
        assert_eq!(status, 202);
    }

    // both changes still pending
    let (_, body) = t
        .request(
            "GET",
            "/v2/changes?select=in-progress&for=foo",
            None,
            &Client::root(),
        )
        .await;
    let changes = body["result"].as_array().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["data"]["snap-names"][0], "foo");
    assert_eq!(changes[0]["ready"], false);

    t.settle().await;

    let (_, body) = t
        .request(
            "GET",
            "/v2/changes?select=in-progress&for=foo",
            None,
            &Client::root(),
        )
        .await;
    assert!(body["result"].as_array().unwrap().is_empty());

    let (_, body) = t
        .request(
            "GET",
            "/v2/changes?select=ready&for=foo",
            None,
            &Client::root(),
        )
        .await;
    assert_eq!(body["result"].as_array().unwrap().len(), 1);

    let (status, _) = t
        .request("GET", "/v2/changes?select=bogus", None, &Client::root())
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_access_control() {
    let t = setup();

    // anonymous non-root peers cannot read user routes
    let (status, _) = t
        .request("GET", "/v2/snaps", None, &Client::user(1000))
        .await;
    assert_eq!(status, 401);

    // nor can connections without peer credentials
    let (status, _) = t
        .request("GET", "/v2/snaps", None, &Client::anonymous())
        .await;
    assert_eq!(status, 401);

    // guest routes are open
    let (status, _) = t
        .request("GET", "/v2/system-info", None, &Client::anonymous())
        .await;
    assert_eq!(status, 200);

    // an authenticated user may read but not mutate
    let client = t.login(1000, "user@example.com", "secret").await;
    let (status, _) = t.request("GET", "/v2/snaps", None, &client).await;
    assert_eq!(status, 200);
    let (status, _) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "install"})),
            &client,
        )
        .await;
    assert_eq!(status, 403);

    // events are root-only
    let (status, _) = t
        .request("GET", "/v2/events", None, &Client::user(1000))
        .await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn test_system_info() {
    let t = setup();

    let (status, body) = t
        .request("GET", "/v2/system-info", None, &Client::anonymous())
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["series"], "16");
    assert_eq!(body["result"]["on-classic"], true);
    assert!(body["result"]["os-release"]["id"].is_string());
}

#[tokio::test]
async fn test_find_and_refresh_select() {
    let t = setup();

    let client = t.login(1000, "user@example.com", "secret").await;

    let (status, body) = t.request("GET", "/v2/find?q=fo", None, &client).await;
    assert_eq!(status, 200);
    assert_eq!(body["sources"][0], "store");
    assert!(body["suggested-currency"].is_string());
    assert_eq!(body["result"][0]["name"], "foo");

    // q and name are exclusive
    let (status, _) = t
        .request("GET", "/v2/find?q=fo&name=foo", None, &client)
        .await;
    assert_eq!(status, 400);

    // select=refresh conflicts with q
    let (status, _) = t
        .request("GET", "/v2/find?q=fo&select=refresh", None, &client)
        .await;
    assert_eq!(status, 400);

    // prefix search
    let (status, body) = t.request("GET", "/v2/find?name=fo*", None, &client).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"][0]["name"], "foo");

    // refresh candidates appear once an older revision is installed
    let (_, body) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "install"})),
            &Client::root(),
        )
        .await;
    assert!(body["change"].is_string());
    t.settle().await;
    t.snap_store.add_snap(remote_snap("foo", 12));

    let (status, body) = t
        .request("GET", "/v2/find?select=refresh", None, &client)
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"][0]["revision"], 12);
}

#[tokio::test]
async fn test_multi_snap_operations() {
    let t = setup();
    t.snap_store.add_snap(remote_snap("bar", 3));

    // per-snap options are rejected for multi ops
    let (status, body) = t
        .request(
            "POST",
            "/v2/snaps",
            Some(json!({"action": "install", "snaps": ["foo"], "channel": "beta"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["result"]["message"]
        .as_str()
        .unwrap()
        .contains("unsupported option"));

    let (status, body) = t
        .request(
            "POST",
            "/v2/snaps",
            Some(json!({"action": "install", "snaps": ["foo", "bar"]})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 202);
    let change_id = body["change"].as_str().unwrap().to_string();

    let (_, body) = t
        .request(
            "GET",
            &format!("/v2/changes/{}", change_id),
            None,
            &Client::root(),
        )
        .await;
    assert_eq!(body["result"]["summary"], "Install snaps \"foo\", \"bar\"");

    t.settle().await;

    // refresh with no target snaps completes immediately
    let (status, body) = t
        .request(
            "POST",
            "/v2/snaps",
            Some(json!({"action": "refresh", "snaps": []})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 202);
    let change_id = body["change"].as_str().unwrap().to_string();
    let (_, body) = t
        .request(
            "GET",
            &format!("/v2/changes/{}", change_id),
            None,
            &Client::root(),
        )
        .await;
    assert!(body["result"]["ready"].as_bool().unwrap() || body["result"]["status"] == "Do");
}

#[tokio::test]
async fn test_abort_change() {
    let t = setup();

    let (_, body) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "install"})),
            &Client::root(),
        )
        .await;
    let change_id = body["change"].as_str().unwrap().to_string();

    // bad action
    let (status, _) = t
        .request(
            "POST",
            &format!("/v2/changes/{}", change_id),
            Some(json!({"action": "undo"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = t
        .request(
            "POST",
            &format!("/v2/changes/{}", change_id),
            Some(json!({"action": "abort"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["id"], change_id.as_str());

    t.settle().await;

    let (_, body) = t
        .request(
            "GET",
            &format!("/v2/changes/{}", change_id),
            None,
            &Client::root(),
        )
        .await;
    assert_eq!(body["result"]["ready"], true);
    assert!(snapd::snapstate::get(&t.daemon.store.lock(), "foo").is_err());

    // aborting a ready change is rejected
    let (status, body) = t
        .request(
            "POST",
            &format!("/v2/changes/{}", change_id),
            Some(json!({"action": "abort"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["result"]["message"]
        .as_str()
        .unwrap()
        .contains("nothing pending"));
}

#[tokio::test]
async fn test_snap_configuration() {
    let t = setup();

    let (status, _) = t
        .request(
            "PUT",
            "/v2/snaps/foo/conf",
            Some(json!({"port": 8080, "host": "0.0.0.0"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 202);
    t.settle().await;

    let (status, body) = t
        .request(
            "GET",
            "/v2/snaps/foo/conf?keys=port,host",
            None,
            &Client::root(),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["port"], 8080);
    assert_eq!(body["result"]["host"], "0.0.0.0");

    let (status, _) = t
        .request("GET", "/v2/snaps/foo/conf", None, &Client::root())
        .await;
    assert_eq!(status, 400);

    let (status, _) = t
        .request(
            "GET",
            "/v2/snaps/foo/conf?keys=absent",
            None,
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_snapctl_hook_helper() {
    let t = setup();
    t.hooks.add_context(
        "ctx-1",
        HookOutput {
            stdout: "8080".to_string(),
            stderr: String::new(),
        },
    );

    // reachable through the hook socket without credentials beyond uid
    let (status, body) = t
        .request(
            "POST",
            "/v2/snapctl",
            Some(json!({"context-id": "ctx-1", "args": ["get", "port"]})),
            &Client::snap_hook(1000),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["stdout"], "8080");

    // not from the regular socket as non-root
    let (status, _) = t
        .request(
            "POST",
            "/v2/snapctl",
            Some(json!({"context-id": "ctx-1", "args": ["get", "port"]})),
            &Client::user(1000),
        )
        .await;
    assert_eq!(status, 401);

    // args are required
    let (status, _) = t
        .request(
            "POST",
            "/v2/snapctl",
            Some(json!({"context-id": "ctx-1", "args": []})),
            &Client::snap_hook(1000),
        )
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_create_user_from_store() {
    let t = setup();
    t.snap_store.add_user_info(
        "dev@example.com",
        StoreUserInfo {
            username: "dev".to_string(),
            ssh_keys: vec!["ssh-ed25519 AAAA dev".to_string()],
            openid_identifier: "dev-id".to_string(),
        },
    );

    let (status, body) = t
        .request(
            "POST",
            "/v2/create-user",
            Some(json!({"email": "dev@example.com", "sudoer": true})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 200, "create-user failed: {}", body);
    assert_eq!(body["result"]["username"], "dev");
    assert_eq!(body["result"]["ssh-key-count"], 1);

    let calls = t.user_adder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "dev");
    // Gecos is the literal email,identifier concatenation
    assert_eq!(calls[0].1.gecos, "dev@example.com,dev-id");
    assert!(calls[0].1.sudoer);

    // empty email is rejected
    let (status, _) = t
        .request(
            "POST",
            "/v2/create-user",
            Some(json!({"email": ""})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);

    // non-root peers never get this far
    let (status, _) = t
        .request(
            "POST",
            "/v2/create-user",
            Some(json!({"email": "dev@example.com"})),
            &Client::user(1000),
        )
        .await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn test_buy_flow() {
    let t = setup();

    // no authenticated user: login-required
    let (status, body) = t
        .request("GET", "/v2/buy/ready", None, &Client::root())
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["result"]["kind"], "login-required");

    let client = t.login(0, "user@example.com", "secret").await;

    let (status, body) = t.request("GET", "/v2/buy/ready", None, &client).await;
    assert_eq!(status, 200, "ready-to-buy failed: {}", body);
    assert_eq!(body["result"], json!(true));

    let (status, body) = t.request("GET", "/v2/buy/methods", None, &client).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"][0], "credit-card");

    // terms not accepted surfaces its own kind
    t.snap_store.set_tos_accepted(false);
    let (status, body) = t.request("GET", "/v2/buy/ready", None, &client).await;
    assert_eq!(status, 400);
    assert_eq!(body["result"]["kind"], "terms-not-accepted");

    // no payment methods likewise
    t.snap_store.set_tos_accepted(true);
    t.snap_store.set_payment_methods(vec![]);
    let (status, body) = t.request("GET", "/v2/buy/ready", None, &client).await;
    assert_eq!(status, 400);
    assert_eq!(body["result"]["kind"], "no-payment-methods");
}

#[tokio::test]
async fn test_sideload_snap() {
    let t = setup();

    let boundary = "XBOUNDARY";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"dangerous\"\r\n\r\ntrue\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"snap\"; \
         filename=\"hello_1.snap\"\r\n\r\nsnap contents\r\n--{b}--\r\n",
        b = boundary
    );

    let (status, reply) = t
        .raw_request(
            "POST",
            "/v2/snaps",
            &format!("multipart/form-data; boundary={}", boundary),
            body.into_bytes(),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 202, "sideload failed: {}", reply);
    let change_id = reply["change"].as_str().unwrap().to_string();

    t.settle().await;

    let (_, body) = t
        .request(
            "GET",
            &format!("/v2/changes/{}", change_id),
            None,
            &Client::root(),
        )
        .await;
    assert_eq!(body["result"]["status"], "Done");
    assert!(body["result"]["summary"]
        .as_str()
        .unwrap()
        .contains("from file"));

    let st = t.daemon.store.lock();
    let snap = snapd::snapstate::get(&st, "hello").unwrap();
    assert!(snap.sideloaded);
    assert!(snap.active);
}

#[tokio::test]
async fn test_sideload_without_assertions_needs_dangerous() {
    let t = setup();

    let boundary = "XBOUNDARY";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"snap\"; \
         filename=\"hello_1.snap\"\r\n\r\nsnap contents\r\n--{b}--\r\n",
        b = boundary
    );

    let (status, reply) = t
        .raw_request(
            "POST",
            "/v2/snaps",
            &format!("multipart/form-data; boundary={}", boundary),
            body.into_bytes(),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);
    assert!(reply["result"]["message"]
        .as_str()
        .unwrap()
        .contains("cannot find signatures"));
}

#[tokio::test]
async fn test_assertions_endpoints() {
    use serde_json::Map;
    use snapd::asserts::{Assertion, KeyPair};

    let t = setup();

    // trust root: account + account-key
    let root_key = KeyPair::generate();
    let mk = |entries: Vec<(&str, serde_json::Value)>| {
        let mut m = Map::new();
        for (k, v) in entries {
            m.insert(k.to_string(), v);
        }
        m
    };
    let trusted_account = Assertion::sign(
        mk(vec![
            ("type", json!("account")),
            ("authority-id", json!("root")),
            ("account-id", json!("root")),
            ("display-name", json!("Root")),
        ]),
        None,
        &root_key,
    )
    .unwrap();
    let trusted_key = Assertion::sign(
        mk(vec![
            ("type", json!("account-key")),
            ("authority-id", json!("root")),
            ("account-id", json!("root")),
            ("public-key-id", json!(root_key.public_key().id())),
            ("public-key", json!(root_key.public_key().encode())),
        ]),
        None,
        &root_key,
    )
    .unwrap();
    t.daemon.trust(vec![trusted_account, trusted_key]);

    let brand = Assertion::sign(
        mk(vec![
            ("type", json!("account")),
            ("authority-id", json!("root")),
            ("account-id", json!("my-brand")),
            ("display-name", json!("My Brand")),
        ]),
        None,
        &root_key,
    )
    .unwrap();

    let mut stream = brand.encode();
    stream.push(b'\n');
    let (status, body) = t
        .raw_request(
            "POST",
            "/v2/assertions",
            "application/x.snapd.assertion",
            stream,
            &Client::root(),
        )
        .await;
    assert_eq!(status, 200, "assert add failed: {}", body);

    let (status, body) = t
        .request(
            "GET",
            "/v2/assertions/account?account-id=my-brand",
            None,
            &Client::root(),
        )
        .await;
    assert_eq!(status, 200);
    assert!(body
        .as_str()
        .map(|s| s.contains("account-id: my-brand"))
        .unwrap_or(false));

    // a bad type name is a bad request
    let (status, _) = t
        .request("GET", "/v2/assertions/flying-carpet", None, &Client::root())
        .await;
    assert_eq!(status, 400);

    // an unsigned statement fails the batch
    let (status, body) = t
        .raw_request(
            "POST",
            "/v2/assertions",
            "application/x.snapd.assertion",
            b"garbage\n\n".to_vec(),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["result"]["message"]
        .as_str()
        .unwrap()
        .contains("cannot decode request body into assertions"));
}

#[tokio::test]
async fn test_unknown_route_and_method() {
    let t = setup();

    let (status, _) = t
        .request("GET", "/v2/no-such-thing", None, &Client::root())
        .await;
    assert_eq!(status, 404);

    let (status, body) = t
        .request("DELETE", "/v2/snaps", None, &Client::root())
        .await;
    assert_eq!(status, 405);
    assert_eq!(body["result"]["message"], "method not allowed");
}

#[tokio::test]
async fn test_enable_disable_cycle() {
    let t = setup();

    let (_, body) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "install"})),
            &Client::root(),
        )
        .await;
    assert!(body["change"].is_string());
    t.settle().await;

    let (status, _) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "disable"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 202);
    t.settle().await;

    let (_, body) = t
        .request("GET", "/v2/snaps/foo", None, &Client::root())
        .await;
    assert_eq!(body["result"]["status"], "installed");

    // enable with a revision is rejected
    let (status, _) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "enable", "revision": 7})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);

    let (status, _) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "enable"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 202);
    t.settle().await;

    let (_, body) = t
        .request("GET", "/v2/snaps/foo", None, &Client::root())
        .await;
    assert_eq!(body["result"]["status"], "active");
}

#[tokio::test]
async fn test_unknown_snap_operations() {
    let t = setup();

    let (status, body) = t
        .request(
            "POST",
            "/v2/snaps/ghost",
            Some(json!({"action": "remove"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["result"]["message"]
        .as_str()
        .unwrap()
        .contains("cannot remove"));

    let (status, _) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "dance"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 400);

    let (status, _) = t
        .request("GET", "/v2/snaps/ghost", None, &Client::root())
        .await;
    assert_eq!(status, 404);
}
