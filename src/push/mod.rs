/**
 * Push Fan-out Pipeline
 *
 * Producer side appends notification payloads to a capped stream;
 * worker consumers decide online -> hold / offline -> web push, and
 * retire subscriptions whose endpoints are gone.
 */

pub mod stream;
pub mod worker;

pub use worker::{PushWorker, VapidSigner};
