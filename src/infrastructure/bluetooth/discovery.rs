//! Discovery engine
//!
//! Walks a peripheral's capability tree once per pass: characteristic reads,
//! then descriptor reads, then subscriptions. Item failures are recorded and
//! the walk moves on. Subscriptions live in a per-pass [`TaskScope`] that is
//! torn down when the services are invalidated or the session ends.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::{
    AppEvent, CapabilityTree, DiscoveryReport, ItemFailure, ItemOperation, ValueSource,
};

use super::peripheral::Peripheral;
use super::protocol::to_hex;
use super::scope::TaskScope;
use super::transport::{LinkEvent, Radio};
use super::BleError;

pub struct DiscoveryEngine {
    radio: Arc<dyn Radio>,
    peripheral: Arc<Peripheral>,
    operation_timeout: Duration,
}

impl DiscoveryEngine {
    pub fn new(radio: Arc<dyn Radio>, peripheral: Arc<Peripheral>, operation_timeout: Duration) -> Self {
        Self {
            radio,
            peripheral,
            operation_timeout,
        }
    }

    /// Run discovery passes until the link event channel closes or the task is
    /// cancelled. A new pass starts after every service invalidation.
    pub async fn run(self, mut link_events: broadcast::Receiver<LinkEvent>) {
        let identity = self.peripheral.identity().clone();
        let mut pass = 0u64;

        loop {
            let discovered = self
                .bounded(self.radio.discover_services(&identity))
                .await;

            let mut pass_scope = None;
            match discovered {
                Ok(tree) => {
                    pass += 1;
                    let tree = Arc::new(tree);
                    info!(
                        "({}) Discovered {} service(s), {} characteristic(s) on {}",
                        pass,
                        tree.services.len(),
                        tree.characteristic_count(),
                        identity
                    );
                    self.peripheral.set_services(Some(tree.clone()), pass);

                    let mut scope = TaskScope::new(format!("pass {} of {}", pass, identity));
                    let report = self.run_pass(pass, &tree, &mut scope).await;
                    info!(
                        "({}) Discovery on {} complete: {} read(s), {} descriptor read(s), {} subscription(s), {} failure(s), {} anomaly(ies)",
                        pass,
                        identity,
                        report.reads,
                        report.descriptor_reads,
                        report.subscriptions,
                        report.failures.len(),
                        report.anomalies.len()
                    );
                    self.peripheral.emit(AppEvent::DiscoveryCompleted {
                        identity: identity.clone(),
                        report,
                    });
                    pass_scope = Some(scope);
                }
                Err(reason) => warn!("Service discovery on {} failed: {}", identity, reason),
            }

            let invalidated = wait_for_invalidation(&mut link_events).await;
            if let Some(scope) = pass_scope {
                self.peripheral.set_services(None, pass);
                scope.shutdown().await;
            }
            if !invalidated {
                return;
            }
            info!("Services of {} invalidated, rediscovering", identity);
        }
    }

    /// Walk `tree` once. Subscription forwarders are spawned into `scope`.
    pub async fn run_pass(
        &self,
        pass: u64,
        tree: &CapabilityTree,
        scope: &mut TaskScope,
    ) -> DiscoveryReport {
        let identity = self.peripheral.identity();
        let mut report = DiscoveryReport {
            pass,
            ..Default::default()
        };

        for characteristic in tree.characteristics() {
            if !characteristic.properties.is_readable() {
                continue;
            }
            let handle = characteristic.handle;
            match self.bounded(self.radio.read(identity, handle)).await {
                Ok(value) => {
                    report.reads += 1;
                    debug!(
                        "({}) {} [{:#06x}] = {}",
                        pass,
                        characteristic.uuid,
                        handle,
                        to_hex(&value)
                    );
                    self.publish(pass, characteristic.uuid, handle, ValueSource::Read, value);
                }
                Err(reason) => {
                    let failure = self.failure(ItemOperation::Read, characteristic.uuid, handle, reason);
                    report.failures.push(failure);
                }
            }
        }

        for characteristic in tree.characteristics() {
            for descriptor in &characteristic.descriptors {
                let handle = descriptor.handle;
                match self.bounded(self.radio.read_descriptor(identity, handle)).await {
                    Ok(value) => {
                        report.descriptor_reads += 1;
                        debug!(
                            "({}) {} / {} [{:#06x}] = {}",
                            pass,
                            characteristic.uuid,
                            descriptor.uuid,
                            handle,
                            to_hex(&value)
                        );
                        self.publish(pass, descriptor.uuid, handle, ValueSource::DescriptorRead, value);
                    }
                    Err(reason) => {
                        let failure =
                            self.failure(ItemOperation::ReadDescriptor, descriptor.uuid, handle, reason);
                        report.failures.push(failure);
                    }
                }
            }
        }

        // Every characteristic is tried; a refusal is only an anomaly when the
        // characteristic advertises notify or indicate.
        for characteristic in tree.characteristics() {
            let handle = characteristic.handle;
            match self.bounded(self.radio.subscribe(identity, handle)).await {
                Ok(stream) => {
                    report.subscriptions += 1;
                    debug!("({}) Subscribed to {} [{:#06x}]", pass, characteristic.uuid, handle);
                    scope.spawn(
                        "notification forwarder",
                        forward(self.peripheral.clone(), pass, characteristic.uuid, handle, stream),
                    );
                }
                Err(reason) if !characteristic.properties.is_subscribable() => {
                    report.expected_refusals += 1;
                    debug!(
                        "({}) {} [{:#06x}] refused subscription as expected: {}",
                        pass, characteristic.uuid, handle, reason
                    );
                }
                Err(reason) => {
                    let failure =
                        self.failure(ItemOperation::Subscribe, characteristic.uuid, handle, reason);
                    report.anomalies.push(failure);
                }
            }
        }

        report
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, BleError>>,
    ) -> Result<T, String> {
        match timeout(self.operation_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(BleError::Timeout.to_string()),
        }
    }

    fn failure(&self, operation: ItemOperation, uuid: Uuid, handle: u16, reason: String) -> ItemFailure {
        let err = BleError::ItemOperationFailed {
            identity: self.peripheral.identity().clone(),
            operation,
            handle,
            reason: reason.clone(),
        };
        warn!("{} ({})", err, uuid);
        self.peripheral
            .emit(AppEvent::Error(err.notice(Some(self.peripheral.identity()))));
        ItemFailure {
            operation,
            uuid,
            handle,
            reason,
        }
    }

    fn publish(&self, pass: u64, uuid: Uuid, handle: u16, source: ValueSource, value: Vec<u8>) {
        self.peripheral.emit(AppEvent::CharacteristicValue {
            identity: self.peripheral.identity().clone(),
            pass,
            uuid,
            handle,
            source,
            value,
        });
    }
}

async fn forward(
    peripheral: Arc<Peripheral>,
    pass: u64,
    uuid: Uuid,
    handle: u16,
    mut stream: mpsc::Receiver<Vec<u8>>,
) {
    let mut updates = 0usize;
    while let Some(value) = stream.recv().await {
        updates += 1;
        debug!("({}) {} [{:#06x}] notified {}", pass, uuid, handle, to_hex(&value));
        peripheral.emit(AppEvent::CharacteristicValue {
            identity: peripheral.identity().clone(),
            pass,
            uuid,
            handle,
            source: ValueSource::Notification,
            value,
        });
    }
    if updates == 0 {
        debug!("({}) No updates from {} [{:#06x}]", pass, uuid, handle);
    }
}

/// Returns `true` on invalidation, `false` once no more link events can arrive.
async fn wait_for_invalidation(link_events: &mut broadcast::Receiver<LinkEvent>) -> bool {
    loop {
        match link_events.recv().await {
            Ok(LinkEvent::ServicesInvalidated) => return true,
            Ok(_) => {}
            // Missed events may have included an invalidation.
            Err(RecvError::Lagged(missed)) => {
                warn!("Discovery missed {} link event(s)", missed);
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Advertisement, Identity, Phy, Service};
    use crate::infrastructure::bluetooth::simulated::{
        blinky_peripheral, characteristic, properties, SimPeripheral, SimRadio,
    };
    use crate::infrastructure::bluetooth::transport::ConnectOptions;

    fn single_characteristic(notify: bool) -> CapabilityTree {
        CapabilityTree::new(vec![Service {
            uuid: Uuid::from_u128(0xa0),
            handle: 1,
            characteristics: vec![characteristic(
                Uuid::from_u128(0xa1),
                2,
                properties(true, false, notify),
                &[],
            )],
        }])
    }

    async fn connected(
        peripheral: SimPeripheral,
    ) -> (Arc<SimRadio>, Arc<Peripheral>, mpsc::UnboundedReceiver<AppEvent>) {
        let identity = peripheral.identity().clone();
        let radio = Arc::new(SimRadio::new());
        radio.add_peripheral(peripheral);
        let options = ConnectOptions {
            preferred_phy: Phy::Le1M,
            timeout: Duration::from_secs(1),
        };
        radio.connect(&identity, &options).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (radio, Arc::new(Peripheral::new(identity, None, tx)), rx)
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_walk() {
        let identity = Identity::le("30:00:00:00:00:01");
        let (radio, peripheral, _events) =
            connected(blinky_peripheral(identity.clone(), "DemoX")).await;
        radio.fail_read(&identity, 0x0012, "insufficient authentication");
        radio.fail_read(&identity, 0x0013, "insufficient authentication");

        let engine = DiscoveryEngine::new(radio.clone(), peripheral, Duration::from_secs(5));
        let tree = radio.discover_services(&identity).await.unwrap();
        let mut scope = TaskScope::new("test");
        let report = engine.run_pass(1, &tree, &mut scope).await;

        assert_eq!(report.reads, 2);
        assert_eq!(report.descriptor_reads, 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].operation, ItemOperation::Read);
        assert_eq!(report.failures[1].operation, ItemOperation::ReadDescriptor);
        assert_eq!(report.subscriptions, 2);
        assert_eq!(report.expected_refusals, 1);
        assert!(report.anomalies.is_empty());
        scope.shutdown().await;
    }

    #[tokio::test]
    async fn test_refused_subscribable_characteristic_is_an_anomaly() {
        let identity = Identity::le("30:00:00:00:00:02");
        // The walked tree claims notify; the peripheral itself refuses.
        let (radio, peripheral, _events) = connected(
            SimPeripheral::new(Advertisement::new(identity.clone()))
                .with_tree(single_characteristic(false)),
        )
        .await;
        let claimed = single_characteristic(true);

        let engine = DiscoveryEngine::new(radio, peripheral, Duration::from_secs(5));
        let mut scope = TaskScope::new("test");
        let report = engine.run_pass(1, &claimed, &mut scope).await;

        assert_eq!(report.subscriptions, 0);
        assert_eq!(report.expected_refusals, 0);
        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(report.anomalies[0].operation, ItemOperation::Subscribe);
    }

    #[tokio::test]
    async fn test_invalidation_starts_new_pass() {
        let identity = Identity::le("30:00:00:00:00:03");
        let (radio, peripheral, mut events) =
            connected(blinky_peripheral(identity.clone(), "DemoX")).await;

        let engine = DiscoveryEngine::new(radio.clone(), peripheral.clone(), Duration::from_secs(5));
        let task = tokio::spawn(engine.run(radio.link_events(&identity)));

        let mut passes = Vec::new();
        while passes.len() < 2 {
            match events.recv().await {
                Some(AppEvent::DiscoveryCompleted { report, .. }) => {
                    passes.push(report.pass);
                    if passes.len() == 1 {
                        radio.invalidate_services(&identity);
                    }
                }
                Some(AppEvent::CharacteristicValue {
                    source: ValueSource::Notification,
                    ..
                }) => panic!("no notifications were sent"),
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(passes, vec![1, 2]);

        // Notifications carry the pass that subscribed.
        assert_eq!(radio.notify(&identity, 0x0022, &[42]), 1);
        loop {
            if let Some(AppEvent::CharacteristicValue {
                pass,
                handle,
                source: ValueSource::Notification,
                value,
                ..
            }) = events.recv().await
            {
                assert_eq!((pass, handle, value), (2, 0x0022, vec![42]));
                break;
            }
        }
        task.abort();
    }
}
