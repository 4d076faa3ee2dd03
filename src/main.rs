use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use gatt_central::domain::filter::ScanFilter;
use gatt_central::domain::models::{
    Advertisement, AppEvent, Identity, MessageSeverity, ValueSource, WriteType,
};
use gatt_central::domain::settings::{Settings, SettingsService};
use gatt_central::infrastructure::bluetooth::protocol::{
    to_hex, BUTTON_CHAR, LED_BUTTON_SERVICE, LED_CHAR,
};
use gatt_central::infrastructure::bluetooth::service::ToggleAction;
use gatt_central::infrastructure::bluetooth::session::Session;
use gatt_central::infrastructure::bluetooth::simulated::{
    blinky_peripheral, SimPeripheral, SimRadio,
};
use gatt_central::infrastructure::bluetooth::CentralService;
use gatt_central::infrastructure::logging::init_logger;

const BLINKS: usize = 9;
const BLINK_INTERVAL: Duration = Duration::from_millis(250);
const BUTTON_PRESS_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new().unwrap_or_else(|e| {
        eprintln!("Failed to load settings ({}), using defaults", e);
        SettingsService::in_memory(Settings::default())
    });
    let _logging_guard = init_logger(&settings_service.get().log_settings)?;
    info!("Starting GATT central demo");
    let settings = Arc::new(Mutex::new(settings_service));

    let radio = Arc::new(SimRadio::new());
    radio.add_peripheral(blinky_peripheral(Identity::le("C0:FF:EE:00:00:01"), "DemoX"));
    radio.add_peripheral(SimPeripheral::new(
        Advertisement::new(Identity::le("C0:FF:EE:00:00:02"))
            .with_name("Other")
            .with_rssi(-81),
    ));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let central = CentralService::new(radio.clone(), event_tx, settings);

    let mut sightings = central.start_scan(ScanFilter::name_contains("Demo")).await?;
    radio.advertise_all();
    radio.advertise_all();
    let sighting = sightings
        .next()
        .await
        .context("Scan ended without a matching peripheral")??;
    drop(sightings);
    central.stop_scan().await;

    let session = match central.toggle_connection(&sighting.identity).await? {
        ToggleAction::Connecting(session) => session,
        ToggleAction::Disconnecting(_) => bail!("{} already had a session", sighting.identity),
    };

    // Stands in for a user pressing the button on the board.
    tokio::spawn(press_button(radio.clone(), session.clone(), BUTTON_PRESS_DELAY));

    let blinks = run_demo(&central, &session, &mut event_rx).await?;
    info!("Blinked {} time(s)", blinks);
    central.disconnect(session.identity());
    session.closed().await;

    for peripheral in central.peripherals() {
        info!(
            "{} ({}): {}",
            peripheral.identity,
            peripheral.name.as_deref().unwrap_or("Unknown"),
            peripheral.state
        );
    }
    central.shutdown().await;
    Ok(())
}

/// Follow `session` until its button is pressed, then blink its LED. Returns
/// the number of LED writes, zero when the session ended first.
async fn run_demo(
    central: &CentralService,
    session: &Session,
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
) -> Result<usize> {
    let identity = session.identity();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = session.closed() => return Ok(0),
        };
        let Some(event) = event else { return Ok(0) };

        match event {
            AppEvent::CharacteristicValue {
                identity: ref from,
                uuid,
                source: ValueSource::Notification,
                ..
            } if from == identity && uuid == BUTTON_CHAR => {
                info!("Button pressed on {}", identity);
                return blink(central, identity).await;
            }
            AppEvent::DiscoveryCompleted { ref report, .. } => {
                info!(
                    "({}) Discovery finished: {} subscription(s), {} failure(s)",
                    report.pass,
                    report.subscriptions,
                    report.failures.len()
                );
                let has_led = central
                    .peripheral(identity)
                    .and_then(|p| p.services())
                    .map_or(false, |tree| tree.service(&LED_BUTTON_SERVICE).is_some());
                if !has_led {
                    info!("{} has no LED Button Service", identity);
                    return Ok(0);
                }
                info!("Waiting for a button press on {}", identity);
            }
            other => log_event(other),
        }
    }
}

fn log_event(event: AppEvent) {
    match event {
        AppEvent::ScanningChanged(scanning) => info!("Scanning: {}", scanning),
        AppEvent::PeripheralDiscovered(peripheral) => info!(
            "Discovered {} ({})",
            peripheral.identity,
            peripheral.name.as_deref().unwrap_or("Unknown")
        ),
        AppEvent::ConnectionStateChanged { identity, state } => info!("{}: {}", identity, state),
        AppEvent::CharacteristicValue {
            pass,
            uuid,
            source: ValueSource::Notification,
            value,
            ..
        } => info!("({}) {} notified {}", pass, uuid, to_hex(&value)),
        AppEvent::Error(notice) => error!("{:?}: {}", notice.kind, notice.message),
        AppEvent::LogMessage(message) if message.severity == MessageSeverity::Warning => {
            warn!("{}", message.message)
        }
        _ => {}
    }
}

/// Blink the LED of a LED Button Service peripheral.
async fn blink(central: &CentralService, identity: &Identity) -> Result<usize> {
    let led = central
        .peripheral(identity)
        .and_then(|p| p.services())
        .and_then(|tree| {
            tree.service(&LED_BUTTON_SERVICE).and_then(|service| {
                service
                    .characteristics
                    .iter()
                    .find(|c| c.uuid == LED_CHAR)
                    .map(|c| c.handle)
            })
        })
        .context("LED characteristic missing")?;

    info!("Blinking LED of {}", identity);
    for i in 0..BLINKS {
        let value = if i % 2 == 0 { 0x01 } else { 0x00 };
        central
            .write(identity, led, &[value], WriteType::WithResponse)
            .await?;
        tokio::time::sleep(BLINK_INTERVAL).await;
    }
    Ok(BLINKS)
}

/// Press the simulated button once the session has discovered its services.
async fn press_button(radio: Arc<SimRadio>, session: Arc<Session>, delay: Duration) {
    let mut services = session.peripheral().watch_services();
    let Ok(tree) = services.wait_for(|s| s.is_some()).await.map(|s| s.clone()) else {
        return;
    };
    let button = tree.as_ref().and_then(|tree| {
        tree.service(&LED_BUTTON_SERVICE)?
            .characteristics
            .iter()
            .find(|c| c.uuid == BUTTON_CHAR)
            .map(|c| c.handle)
    });
    if let Some(button) = button {
        tokio::time::sleep(delay).await;
        radio.notify(session.identity(), button, &[0x01]);
    }
}
