//! Bus forwarders.
//!
//! Each subscribed channel gets one task that decodes payloads and submits
//! them to the service. Own echoes and malformed payloads stop here.

use davra_bus::{cloud, local, BusError, Decoded};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::intent::{AgentHandle, Intent};

/// Which bus a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    /// Device-local broker.
    Local,
    /// Server broker.
    Cloud,
}

impl Bus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

/// Decode one payload into an intent.
///
/// Returns `Ok(None)` for the agent's own echo and for payloads that carry
/// nothing the agent handles.
///
/// # Errors
///
/// Returns `BusError::Malformed` if the payload cannot be decoded.
pub fn decode(bus: Bus, payload: &[u8]) -> Result<Option<Intent>, BusError> {
    let intent = match bus {
        Bus::Local => match local::decode(payload)? {
            Decoded::OwnEcho => None,
            Decoded::Messages { messages, .. } if messages.is_empty() => None,
            Decoded::Messages { origin, messages } => Some(Intent::Local { origin, messages }),
        },
        Bus::Cloud => match cloud::decode(payload)? {
            Decoded::OwnEcho => None,
            Decoded::Messages { messages, .. } if messages.is_empty() => None,
            Decoded::Messages { messages, .. } => Some(Intent::Cloud(messages)),
        },
    };
    Ok(intent)
}

/// Forward payloads from `bus` to the service until either side closes.
pub fn spawn(bus: Bus, mut payloads: mpsc::Receiver<Vec<u8>>, handle: AgentHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = payloads.recv().await {
            let intent = match decode(bus, &payload) {
                Ok(Some(intent)) => intent,
                Ok(None) => {
                    debug!(bus = bus.as_str(), "Ignoring echo or empty message");
                    continue;
                }
                Err(e) => {
                    warn!(
                        bus = bus.as_str(),
                        error = %e,
                        payload = %String::from_utf8_lossy(&payload),
                        "Dropping malformed message"
                    );
                    continue;
                }
            };
            if handle.submit(intent).await.is_err() {
                debug!(bus = bus.as_str(), "Service stopped, forwarder exiting");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use davra_bus::{CloudMessage, LocalMessage, Origin};

    #[test]
    fn own_echo_produces_nothing() {
        let payload = br#"{"agentHeartbeat": 1, "fromAgent": "1.8.0"}"#;
        assert!(decode(Bus::Local, payload).unwrap().is_none());

        let payload = br#"{"registerCapability": "x", "origin": "agent"}"#;
        assert!(decode(Bus::Local, payload).unwrap().is_none());
    }

    #[test]
    fn untagged_local_message_is_forwarded() {
        let payload = br#"{"connectToAgent": "sensor"}"#;
        match decode(Bus::Local, payload).unwrap() {
            Some(Intent::Local { origin, messages }) => {
                assert_eq!(origin, Origin::Unknown);
                assert_eq!(
                    messages,
                    vec![LocalMessage::Connect {
                        application: "sensor".into()
                    }]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cloud_sentinel_becomes_job_check() {
        let intent = decode(Bus::Cloud, b"davra.announcement:check-for-jobs").unwrap();
        assert!(matches!(
            intent,
            Some(Intent::Cloud(messages)) if messages == vec![CloudMessage::CheckForJobs]
        ));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(decode(Bus::Local, b"not json").is_err());
    }

    #[test]
    fn unrelated_message_is_ignored() {
        assert!(decode(Bus::Local, br#"{"name": "agent-test"}"#)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn forwarder_submits_decoded_messages() {
        let (handle, mut intents) = AgentHandle::channel(4);
        let (tx, rx) = mpsc::channel(4);
        let task = spawn(Bus::Cloud, rx, handle);

        tx.send(b"garbage{".to_vec()).await.unwrap();
        tx.send(br#"{"davra-announcement": "check-for-jobs"}"#.to_vec())
            .await
            .unwrap();
        drop(tx);

        assert!(matches!(intents.recv().await, Some(Intent::Cloud(_))));
        task.await.unwrap();
    }
}
