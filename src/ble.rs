//! Bluetooth LE transport on top of `btleplug`.
//!
//! The Daly Bluetooth module exposes a UART bridge: requests are written to
//! characteristic `0xFFF2`, replies arrive as notifications of `0xFFF1`.

use crate::error::{Error, Result};
use crate::transport::{DeviceAddress, Transport};
use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Characteristic the BMS notifies its replies on.
pub const NOTIFY_CHARACTERISTIC: Uuid = uuid_from_u16(0xfff1);
/// Characteristic requests are written to.
pub const WRITE_CHARACTERISTIC: Uuid = uuid_from_u16(0xfff2);

const SCAN_INTERVAL: Duration = Duration::from_millis(500);

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;
type Events = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// An open connection to one BMS.
pub struct BleLink {
    peripheral: Peripheral,
    peripheral_id: PeripheralId,
    write_characteristic: Characteristic,
    notifications: Notifications,
    /// Adapter events, watched for the disconnect of this peripheral.
    events: Events,
}

/// Something that can end a running scan.
#[async_trait]
trait Scanner: Send + Sync + 'static {
    async fn stop(&self);
}

#[async_trait]
impl Scanner for Adapter {
    async fn stop(&self) {
        if let Err(err) = self.stop_scan().await {
            log::debug!("Stopping scan failed: {err}");
        }
    }
}

/// A running scan. Dropping the guard, e.g. when the connect timeout
/// cancels the search, stops the scan on a background task.
struct ScanGuard<S: Scanner> {
    scanner: Option<S>,
}

impl<S: Scanner> ScanGuard<S> {
    fn new(scanner: S) -> Self {
        Self {
            scanner: Some(scanner),
        }
    }

    async fn stop(mut self) {
        if let Some(scanner) = self.scanner.take() {
            scanner.stop().await;
        }
    }
}

impl<S: Scanner> Drop for ScanGuard<S> {
    fn drop(&mut self) {
        let Some(scanner) = self.scanner.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { scanner.stop().await });
            }
            Err(_) => log::warn!("Scan left running: no runtime to stop it on"),
        }
    }
}

/// Next chunk notified on [`NOTIFY_CHARACTERISTIC`], or `None` once
/// `is_disconnect` matches an adapter event or either stream ends.
async fn next_notification<N, E>(
    notifications: &mut N,
    events: &mut E,
    is_disconnect: impl Fn(&E::Item) -> bool,
) -> Option<Vec<u8>>
where
    N: Stream<Item = ValueNotification> + Unpin,
    E: Stream + Unpin,
{
    loop {
        tokio::select! {
            notification = notifications.next() => {
                let notification = notification?;
                if notification.uuid == NOTIFY_CHARACTERISTIC {
                    return Some(notification.value);
                }
                log::trace!("Ignoring notification of {}", notification.uuid);
            }
            event = events.next() => match event {
                Some(event) if is_disconnect(&event) => {
                    log::debug!("Peripheral disconnected");
                    return None;
                }
                Some(_) => {}
                None => return None,
            },
        }
    }
}

/// Transport over the first Bluetooth adapter of the host.
#[derive(Default)]
pub struct BleTransport {
    adapter: Option<Adapter>,
}

impl BleTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let manager = Manager::new().await.map_err(Error::transport)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(Error::transport)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Transport("no Bluetooth adapter found".into()))?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    /// Scans until the peripheral shows up. The caller bounds the wait.
    async fn find(adapter: &Adapter, target: BDAddr) -> Result<Peripheral> {
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::transport)?;
        let scan = ScanGuard::new(adapter.clone());
        loop {
            for peripheral in adapter.peripherals().await.map_err(Error::transport)? {
                if peripheral.address() == target {
                    scan.stop().await;
                    return Ok(peripheral);
                }
            }
            tokio::time::sleep(SCAN_INTERVAL).await;
        }
    }
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or_else(|| Error::Transport(format!("characteristic {uuid} not found").into()))
}

#[async_trait]
impl Transport for BleTransport {
    type Link = BleLink;

    async fn connect(&mut self, address: &DeviceAddress) -> Result<BleLink> {
        let adapter = self.adapter().await?;
        let peripheral = Self::find(&adapter, BDAddr::from(address.octets())).await?;

        if !peripheral.is_connected().await.map_err(Error::transport)? {
            peripheral.connect().await.map_err(Error::transport)?;
        }
        peripheral
            .discover_services()
            .await
            .map_err(Error::transport)?;

        let notify_characteristic = characteristic(&peripheral, NOTIFY_CHARACTERISTIC)?;
        let write_characteristic = characteristic(&peripheral, WRITE_CHARACTERISTIC)?;
        peripheral
            .subscribe(&notify_characteristic)
            .await
            .map_err(Error::transport)?;
        let notifications = peripheral.notifications().await.map_err(Error::transport)?;
        let events = adapter.events().await.map_err(Error::transport)?;
        log::debug!("Subscribed to {NOTIFY_CHARACTERISTIC} of {address}");

        Ok(BleLink {
            peripheral_id: peripheral.id(),
            peripheral,
            write_characteristic,
            notifications,
            events,
        })
    }

    async fn write(&mut self, link: &mut BleLink, bytes: &[u8]) -> Result<()> {
        link.peripheral
            .write(&link.write_characteristic, bytes, WriteType::WithoutResponse)
            .await
            .map_err(Error::transport)
    }

    async fn notification(&mut self, link: &mut BleLink) -> Option<Vec<u8>> {
        let id = &link.peripheral_id;
        next_notification(&mut link.notifications, &mut link.events, |event| {
            matches!(event, CentralEvent::DeviceDisconnected(disconnected) if disconnected == id)
        })
        .await
    }

    async fn disconnect(&mut self, link: BleLink) -> Result<()> {
        link.peripheral.disconnect().await.map_err(Error::transport)
    }
}
