//! Event delivery: one sequential lane per resource kind.
//!
//! Events of the same kind are applied in order; the credential lane and the
//! declaration lane run concurrently with no ordering between them.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ResourceKind, WatchEvent};
use crate::reconcile::Reconciler;

/// Sender half of the two delivery lanes.
#[derive(Debug, Clone)]
pub struct EventSink {
    credentials: mpsc::UnboundedSender<WatchEvent>,
    declarations: mpsc::UnboundedSender<WatchEvent>,
}

impl EventSink {
    /// A sink whose lanes are handed back to the caller instead of a pump.
    pub fn detached() -> (
        Self,
        mpsc::UnboundedReceiver<WatchEvent>,
        mpsc::UnboundedReceiver<WatchEvent>,
    ) {
        let (cred_tx, cred_rx) = mpsc::unbounded_channel();
        let (decl_tx, decl_rx) = mpsc::unbounded_channel();
        (
            Self {
                credentials: cred_tx,
                declarations: decl_tx,
            },
            cred_rx,
            decl_rx,
        )
    }

    /// Route an event to its kind's lane. Returns false once the pump is gone.
    pub fn send(&self, event: WatchEvent) -> bool {
        let lane = match event.kind() {
            ResourceKind::Credential => &self.credentials,
            ResourceKind::Declaration => &self.declarations,
        };
        lane.send(event).is_ok()
    }
}

/// Start both delivery lanes feeding `reconciler`. Each lane stops when the
/// sink is dropped or `cancel` fires.
pub fn spawn_pump(
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) -> (EventSink, Vec<JoinHandle<()>>) {
    let (sink, cred_rx, decl_rx) = EventSink::detached();
    let handles = vec![
        spawn_lane("credentials", cred_rx, reconciler.clone(), cancel.clone()),
        spawn_lane("declarations", decl_rx, reconciler, cancel),
    ];
    (sink, handles)
}

fn spawn_lane(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => reconciler.handle(event),
                    None => break,
                },
            }
        }
        tracing::debug!("watch lane {} stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{
        CredentialRecord, DeclarationRecord, MemoryCache, CREDENTIAL_LABEL,
        CREDENTIAL_LABEL_VALUE,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const SCOPES: usize = 5;

    fn credential(i: usize) -> CredentialRecord {
        let mut rec = CredentialRecord {
            namespace: "a".into(),
            name: format!("c{}", i),
            resource_version: "1".into(),
            ..Default::default()
        };
        rec.labels
            .insert(CREDENTIAL_LABEL.into(), CREDENTIAL_LABEL_VALUE.into());
        rec
    }

    fn declaration(i: usize) -> DeclarationRecord {
        DeclarationRecord {
            namespace: "a".into(),
            name: format!("d{}", i),
            resource_version: "1".into(),
            decl_type: "mcp".into(),
            func_name: format!("f{}", i),
            args: format!(r#"{{"token":"c{}","tools":[{{"name":"t{}"}}]}}"#, i, i).into_bytes(),
        }
    }

    async fn join(lanes: Vec<JoinHandle<()>>) {
        for lane in lanes {
            tokio::time::timeout(Duration::from_secs(5), lane)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lanes_converge() {
        let expected: Vec<String> = (0..SCOPES).map(|i| format!("/a/c{}/f{}", i, i)).collect();

        for round in 0..200 {
            let cache = Arc::new(MemoryCache::new(""));
            let reconciler = Arc::new(Reconciler::new(cache.clone(), &CancellationToken::new()));
            let (sink, lanes) = spawn_pump(reconciler.clone(), CancellationToken::new());

            // Vary the interleaving per round: declarations first on odd rounds,
            // and a rotating start index within each kind.
            let mut events = Vec::new();
            for step in 0..SCOPES {
                let i = (step + round) % SCOPES;
                let cred = cache.upsert_credential(credential(i));
                let decl = cache.upsert_declaration(declaration(SCOPES - 1 - i));
                if round % 2 == 0 {
                    events.extend(cred);
                    events.extend(decl);
                } else {
                    events.extend(decl);
                    events.extend(cred);
                }
            }
            for event in events {
                assert!(sink.send(event));
            }
            drop(sink);
            join(lanes).await;

            let table = reconciler.routes().load();
            let mut paths: Vec<String> =
                table.function_paths().into_iter().map(String::from).collect();
            paths.sort();
            assert_eq!(paths, expected, "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_lanes_stop_on_cancel() {
        let cache = Arc::new(MemoryCache::new(""));
        let reconciler = Arc::new(Reconciler::new(cache, &CancellationToken::new()));
        let cancel = CancellationToken::new();
        let (sink, lanes) = spawn_pump(reconciler, cancel.clone());

        cancel.cancel();
        join(lanes).await;

        assert!(!sink.send(WatchEvent::Upserted(crate::watch::Resource::Credential(
            credential(0)
        ))));
    }

    #[tokio::test]
    async fn test_lanes_stop_when_sink_dropped() {
        let cache = Arc::new(MemoryCache::new(""));
        let reconciler = Arc::new(Reconciler::new(cache.clone(), &CancellationToken::new()));
        let (sink, lanes) = spawn_pump(reconciler.clone(), CancellationToken::new());

        let event = cache.upsert_credential(credential(0)).unwrap();
        assert!(sink.send(event));
        drop(sink);
        join(lanes).await;

        // Events queued before the drop are still applied.
        assert_eq!(reconciler.scopes().len(), 1);
    }

    #[test]
    fn test_send_routes_by_kind() {
        let (sink, mut cred_rx, mut decl_rx) = EventSink::detached();
        assert!(sink.send(WatchEvent::Upserted(crate::watch::Resource::Declaration(
            declaration(0)
        ))));
        assert!(cred_rx.try_recv().is_err());
        assert!(matches!(
            decl_rx.try_recv().unwrap(),
            WatchEvent::Upserted(crate::watch::Resource::Declaration(_))
        ));
    }
}
