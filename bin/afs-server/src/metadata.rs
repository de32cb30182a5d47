//! Post-commit metadata registration
//!
//! After a transaction commits, the objects it touched are reported to an
//! external metadata service. Registration is fire-and-forget: the commit
//! has already happened, so a slow or failing service only produces a
//! warning.

use afs_common::{Error, Operation, Result, TxnId};
use afs_txn::PostCommitHook;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Body posted to the metadata service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub instance: Uuid,
    pub txn: u64,
    /// Owners touched by the transaction, sorted
    pub owners: Vec<String>,
    pub changes: Vec<Change>,
}

/// One committed operation as seen by the metadata service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub kind: &'static str,
    pub objects: Vec<String>,
}

impl Registration {
    /// Summarize a committed transaction; `None` when nothing changed
    pub fn from_commit(instance: Uuid, txn: TxnId, ops: &[Operation]) -> Option<Self> {
        if ops.is_empty() {
            return None;
        }
        let owners: BTreeSet<String> = ops
            .iter()
            .flat_map(Operation::owners)
            .map(|owner| owner.as_str().to_string())
            .collect();
        let changes = ops
            .iter()
            .map(|op| Change {
                kind: op.kind(),
                objects: op.objects().iter().map(ToString::to_string).collect(),
            })
            .collect();
        Some(Self {
            instance,
            txn: txn.as_u64(),
            owners: owners.into_iter().collect(),
            changes,
        })
    }
}

/// Hook posting a [`Registration`] for every commit
pub struct MetadataRegistrar {
    endpoint: String,
    client: reqwest::Client,
    runtime: Handle,
    instance: Uuid,
}

impl MetadataRegistrar {
    /// Create a registrar; must be called from within a tokio runtime
    pub fn new(endpoint: String, timeout: Duration, instance: Uuid) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::Configuration("metadata registration needs a tokio runtime".into())
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("metadata client: {e}")))?;
        Ok(Self {
            endpoint,
            client,
            runtime,
            instance,
        })
    }

    async fn post(client: reqwest::Client, endpoint: String, registration: Registration) {
        let txn = registration.txn;
        match client.post(&endpoint).json(&registration).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Registered txn-{txn} with metadata service");
            }
            Ok(response) => {
                warn!(
                    "Metadata service rejected txn-{txn}: HTTP {}",
                    response.status()
                );
            }
            Err(e) if e.is_timeout() => {
                warn!("Metadata registration of txn-{txn} timed out");
            }
            Err(e) => {
                warn!("Metadata registration of txn-{txn} failed: {e}");
            }
        }
    }
}

impl PostCommitHook for MetadataRegistrar {
    fn name(&self) -> &str {
        "metadata-registrar"
    }

    fn after_commit(&self, txn: TxnId, ops: &[Operation]) -> Result<()> {
        let Some(registration) = Registration::from_commit(self.instance, txn, ops) else {
            return Ok(());
        };
        self.runtime.spawn(Self::post(
            self.client.clone(),
            self.endpoint.clone(),
            registration,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afs_common::{ObjectPath, ObjectRef, OwnerId};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn obj(owner: &str, path: &str) -> ObjectRef {
        ObjectRef::new(
            OwnerId::new(owner).unwrap(),
            ObjectPath::new(path).unwrap(),
        )
    }

    /// Accept one HTTP request, answer 200 and hand back its body
    async fn serve_once(listener: TcpListener, body_tx: oneshot::Sender<String>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let (header_end, content_length) = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
                let length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .map_or(0, |v| v.trim().parse::<usize>().unwrap());
                break (pos + 4, length);
            }
        };
        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before body");
            buf.extend_from_slice(&chunk[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let body = String::from_utf8(buf[header_end..header_end + content_length].to_vec()).unwrap();
        let _ = body_tx.send(body);
    }

    #[test]
    fn test_registration_summary() {
        let instance = Uuid::new_v4();
        let ops = vec![
            Operation::Create {
                object: obj("bob", "a"),
            },
            Operation::Copy {
                source: obj("bob", "a"),
                target: obj("alice", "b"),
            },
        ];

        let reg = Registration::from_commit(instance, TxnId::new(9), &ops).unwrap();
        assert_eq!(reg.txn, 9);
        assert_eq!(reg.owners, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(reg.changes.len(), 2);
        assert_eq!(reg.changes[0].kind, Operation::Create { object: obj("bob", "a") }.kind());
        assert_eq!(reg.changes[1].objects, vec!["bob/a".to_string(), "alice/b".to_string()]);

        assert!(Registration::from_commit(instance, TxnId::new(10), &[]).is_none());
    }

    #[tokio::test]
    async fn test_commit_is_posted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (body_tx, body_rx) = oneshot::channel();
        tokio::spawn(serve_once(listener, body_tx));

        let instance = Uuid::new_v4();
        let registrar = MetadataRegistrar::new(
            format!("http://{addr}/register"),
            Duration::from_secs(5),
            instance,
        )
        .unwrap();
        let ops = vec![Operation::Delete {
            object: obj("carol", "old"),
        }];
        registrar.after_commit(TxnId::new(42), &ops).unwrap();

        let body = tokio::time::timeout(Duration::from_secs(5), body_rx)
            .await
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["txn"], 42);
        assert_eq!(json["instance"], instance.to_string());
        assert_eq!(json["owners"][0], "carol");
        assert_eq!(json["changes"][0]["objects"][0], "carol/old");
    }

    #[test]
    fn test_requires_runtime() {
        let result = MetadataRegistrar::new(
            "http://127.0.0.1:1/".into(),
            Duration::from_secs(1),
            Uuid::nil(),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
