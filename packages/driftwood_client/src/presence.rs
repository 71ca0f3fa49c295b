//! Presence: best-effort leave signalling and gallery leases.
//!
//! A lease is a time-bounded claim on a gallery's presence scope, renewed
//! in the background while the user is viewing. Departure is announced with
//! a fire-and-forget leave notice that must be deliverable even while the
//! client is tearing down, so it never goes through the admission-gated
//! request path and is never awaited.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Payload of a leave notice, POSTed to `<base>/api/presence/leave`.
#[derive(Debug, Clone, Serialize)]
pub struct LeaveNotice {
    pub gallery_id: String,
    pub lease_id: String,
    pub client_id: String,
}

/// A delivery primitive that survives client teardown without waiting for a
/// response. Returns whether a dispatch was attempted, not whether it
/// succeeded.
pub trait BeaconSender: Send + Sync {
    fn try_send(&self, url: &str, body: &[u8]) -> bool;
}

/// Fallback delivery: fire the request without waiting and without blocking
/// teardown.
pub trait UnloadSafeSender: Send + Sync {
    fn send_detached(&self, url: &str, body: Vec<u8>);
}

/// Production fallback: a detached POST on the runtime with a short timeout
/// so it cannot outlive teardown by much. Failures are logged and dropped.
pub struct DetachedHttpSender {
    client: reqwest::Client,
}

impl DetachedHttpSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl UnloadSafeSender for DetachedHttpSender {
    fn send_detached(&self, url: &str, body: Vec<u8>) {
        let client = self.client.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
            if let Err(err) = result {
                debug!(url = %url, error = %err, "leave notice delivery failed");
            }
        });
    }
}

/// One interface over both delivery paths; callers never learn which was
/// taken.
pub struct PresenceSignal {
    leave_url: String,
    beacon: Option<Arc<dyn BeaconSender>>,
    fallback: Arc<dyn UnloadSafeSender>,
}

impl PresenceSignal {
    pub fn new(
        leave_url: impl Into<String>,
        beacon: Option<Arc<dyn BeaconSender>>,
        fallback: Arc<dyn UnloadSafeSender>,
    ) -> Self {
        Self {
            leave_url: leave_url.into(),
            beacon,
            fallback,
        }
    }

    /// Announce departure from a gallery. Returns whether a delivery attempt
    /// was dispatched; delivery itself is never awaited.
    pub fn dispatch_leave(&self, notice: &LeaveNotice) -> bool {
        let body = match serde_json::to_vec(notice) {
            Ok(body) => body,
            Err(err) => {
                debug!(error = %err, "failed to encode leave notice");
                return false;
            }
        };
        if let Some(beacon) = &self.beacon {
            return beacon.try_send(&self.leave_url, &body);
        }
        self.fallback.send_detached(&self.leave_url, body);
        true
    }
}

/// Renewal payload POSTed to `<base>/api/presence/enter`, both on acquire
/// and on every renewal tick.
#[derive(Debug, Clone, Serialize)]
struct LeaseRenewal<'a> {
    gallery_id: &'a str,
    lease_id: &'a str,
    client_id: &'a str,
    ttl_secs: u64,
}

/// A held claim on a gallery's presence scope, renewed in the background
/// until released. Dropping without [`PresenceLease::release`] only stops
/// renewal; the server expires the lease on its own.
pub struct PresenceLease {
    gallery_id: String,
    lease_id: String,
    client_id: String,
    renew_task: CancellationToken,
}

impl PresenceLease {
    /// Claim the gallery and start renewing every `ttl / 2`. Must be called
    /// from within a tokio runtime.
    pub fn acquire(
        client: reqwest::Client,
        enter_url: impl Into<String>,
        gallery_id: impl Into<String>,
        client_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let gallery_id = gallery_id.into();
        let client_id = client_id.into();
        let lease_id = Uuid::new_v4().to_string();
        let enter_url = enter_url.into();
        let cancel = CancellationToken::new();

        info!(gallery = %gallery_id, lease = %lease_id, "acquiring presence lease");

        let task_cancel = cancel.clone();
        let task_gallery = gallery_id.clone();
        let task_lease = lease_id.clone();
        let task_client = client_id.clone();
        tokio::spawn(async move {
            let renew_every = ttl / 2;
            loop {
                renew(
                    &client,
                    &enter_url,
                    &task_gallery,
                    &task_lease,
                    &task_client,
                    ttl,
                )
                .await;
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(renew_every) => {}
                }
            }
        });

        Self {
            gallery_id,
            lease_id,
            client_id,
            renew_task: cancel,
        }
    }

    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    /// Stop renewing and announce departure through `signal`. Returns what
    /// the dispatch returned.
    pub fn release(self, signal: &PresenceSignal) -> bool {
        self.renew_task.cancel();
        signal.dispatch_leave(&LeaveNotice {
            gallery_id: self.gallery_id.clone(),
            lease_id: self.lease_id.clone(),
            client_id: self.client_id.clone(),
        })
    }
}

impl Drop for PresenceLease {
    fn drop(&mut self) {
        self.renew_task.cancel();
    }
}

async fn renew(
    client: &reqwest::Client,
    enter_url: &str,
    gallery_id: &str,
    lease_id: &str,
    client_id: &str,
    ttl: Duration,
) {
    let payload = LeaseRenewal {
        gallery_id,
        lease_id,
        client_id,
        ttl_secs: ttl.as_secs(),
    };
    let result = client
        .post(enter_url)
        .json(&payload)
        .timeout(Duration::from_secs(5))
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            debug!(gallery = %gallery_id, status = %response.status(), "lease renewal rejected");
        }
        Err(err) => {
            debug!(gallery = %gallery_id, error = %err, "lease renewal failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingBeacon {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        accept: std::sync::atomic::AtomicBool,
    }

    impl RecordingBeacon {
        fn accepting() -> Self {
            let beacon = Self::default();
            beacon.accept.store(true, Ordering::SeqCst);
            beacon
        }
    }

    impl BeaconSender for RecordingBeacon {
        fn try_send(&self, url: &str, body: &[u8]) -> bool {
            self.sent.lock().unwrap().push((url.into(), body.into()));
            self.accept.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingFallback {
        calls: AtomicUsize,
    }

    impl UnloadSafeSender for RecordingFallback {
        fn send_detached(&self, _url: &str, _body: Vec<u8>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn notice() -> LeaveNotice {
        LeaveNotice {
            gallery_id: "g1".into(),
            lease_id: "lease-1".into(),
            client_id: "tab-1".into(),
        }
    }

    #[test]
    fn beacon_path_skips_fallback() {
        let beacon = Arc::new(RecordingBeacon::accepting());
        let fallback = Arc::new(RecordingFallback::default());
        let signal = PresenceSignal::new(
            "http://gallery.test/api/presence/leave",
            Some(beacon.clone()),
            fallback.clone(),
        );

        assert!(signal.dispatch_leave(&notice()));

        let sent = beacon.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "http://gallery.test/api/presence/leave");
        let payload: serde_json::Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(payload["gallery_id"], "g1");
        assert_eq!(payload["lease_id"], "lease-1");
        assert_eq!(payload["client_id"], "tab-1");
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fallback_path_when_beacon_unavailable() {
        let fallback = Arc::new(RecordingFallback::default());
        let signal = PresenceSignal::new(
            "http://gallery.test/api/presence/leave",
            None,
            fallback.clone(),
        );

        assert!(signal.dispatch_leave(&notice()));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn beacon_refusal_is_reported() {
        let beacon = Arc::new(RecordingBeacon::default());
        let fallback = Arc::new(RecordingFallback::default());
        let signal = PresenceSignal::new(
            "http://gallery.test/api/presence/leave",
            Some(beacon),
            fallback.clone(),
        );

        // The beacon was available but refused the payload: no silent
        // switch to the fallback, the caller just learns nothing went out.
        assert!(!signal.dispatch_leave(&notice()));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }
}
