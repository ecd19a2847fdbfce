/**
 * Token Lifecycle Integration Tests
 *
 * Exercises the pure core end to end: ID generation feeding token
 * encode/decode across both token classes, and the cache tier the
 * decoded credentials land in.
 */

use std::time::Duration;

use lv_realtime::auth::cache::{CheckedToken, TtlMap};
use lv_realtime::auth::token::{
    decode_token, encode_token, ACCESS_TOKEN_TTL_SECS, REFRESH_TOKEN_TTL_SECS,
};
use lv_realtime::snowflake::SnowflakeGenerator;

const ACCESS_KEY: &str = "integration-access-key";
const REFRESH_KEY: &str = "integration-refresh-key";
const SIGNING_KEY: &str = "integration-signing-key";

#[test]
fn access_and_refresh_tokens_are_not_interchangeable() {
    let ids = SnowflakeGenerator::new(1, 2);
    let user_id = ids.generate();

    let access = encode_token(user_id, "nonce16chars0000", false, ACCESS_KEY, SIGNING_KEY);
    let refresh = encode_token(user_id, "nonce16chars0000", true, REFRESH_KEY, SIGNING_KEY);
    assert_ne!(access, refresh);

    // Each decodes under its own key.
    let decoded = decode_token(&access, ACCESS_KEY, SIGNING_KEY).unwrap();
    assert_eq!(decoded.user_id, user_id);
    let decoded = decode_token(&refresh, REFRESH_KEY, SIGNING_KEY).unwrap();
    assert_eq!(decoded.user_id, user_id);

    // A refresh token presented where an access token is expected must
    // not decode into a usable credential.
    assert!(decode_token(&refresh, ACCESS_KEY, SIGNING_KEY).is_err());
}

#[test]
fn token_lifetimes_differ_by_class() {
    let now = chrono::Utc::now().timestamp();
    let access = decode_token(
        &encode_token(5, "secret", false, ACCESS_KEY, SIGNING_KEY),
        ACCESS_KEY,
        SIGNING_KEY,
    )
    .unwrap();
    let refresh = decode_token(
        &encode_token(5, "secret", true, REFRESH_KEY, SIGNING_KEY),
        REFRESH_KEY,
        SIGNING_KEY,
    )
    .unwrap();

    assert!(access.expiration - now <= ACCESS_TOKEN_TTL_SECS);
    assert!(refresh.expiration - now > REFRESH_TOKEN_TTL_SECS - 60);
}

#[test]
fn snowflake_ids_order_across_token_issuance() {
    let ids = SnowflakeGenerator::new(3, 4);
    let mut previous = 0i64;
    for _ in 0..1000 {
        let id = ids.generate();
        assert!(id > previous);
        previous = id;
    }
}

#[test]
fn cache_tier_holds_and_purges_credentials() {
    let mut tier = TtlMap::default();
    let checked = CheckedToken {
        user_id: 11,
        session_id: 22,
        secret: "secret".to_string(),
        expiration: chrono::Utc::now().timestamp() + 600,
    };
    tier.insert("auth:11:secret".to_string(), checked, Duration::from_secs(60));

    let hit = tier.get("auth:11:secret").unwrap();
    assert_eq!(hit.session_id, 22);

    tier.remove_by_prefix("auth:11:");
    assert!(tier.get("auth:11:secret").is_none());
}
