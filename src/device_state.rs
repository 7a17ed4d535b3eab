//! Emulated meter device state.
//!
//! Published quantities live in an object tree keyed by path (`/Ac/L1/Power`,
//! `/Ac/Energy/Forward`, ...), each holding a numeric value and its display
//! text. Updates arrive through a bounded channel so publishing never blocks
//! the caller; a background task applies them and notifies subscribers. The
//! same state is mirrored into a SunSpec model 213 register image that remote
//! clients can read over Modbus TCP.

use crate::error::PublishError;
use std::{
    collections::HashMap,
    future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{
    broadcast,
    mpsc::{self, error::TrySendError, Receiver, Sender},
};
use tokio_modbus::prelude::*;
use tracing::{debug, info, trace, warn};

const UPDATE_QUEUE_DEPTH: usize = 128;
const CHANGE_QUEUE_DEPTH: usize = 64;
const WH_PER_KWH: f64 = 1000.0;

const SUNSPEC_BASE: u16 = 40000;
const MODEL_213_START: u16 = 40071;
const MODEL_213_LEN: u16 = 124;

/// Sink for device quantities.
///
/// Implementations must not block: the bridge calls this while holding its
/// state lock.
pub trait Publisher: Send + Sync {
    fn publish(&self, path: &str, value: f64, unit: &str) -> Result<(), PublishError>;
}

/// Display text for a value, e.g. `230.00V`.
pub fn format_text(value: f64, unit: &str) -> String {
    format!("{value:.2}{unit}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusItem {
    pub value: f64,
    pub text: String,
}

/// Change notification sent to subscribers after an item is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemChanged {
    pub path: String,
    pub item: BusItem,
}

#[derive(Debug)]
struct ItemUpdate {
    path: String,
    value: f64,
    unit: String,
}

#[derive(Clone)]
pub struct DeviceState {
    items: Arc<Mutex<HashMap<String, BusItem>>>,
    holding_registers: Arc<Mutex<HashMap<u16, u16>>>,
    changes: broadcast::Sender<ItemChanged>,
}

/// Publishing side of a [`DeviceState`].
#[derive(Clone)]
pub struct DeviceStateHandle {
    updates: Sender<ItemUpdate>,
}

impl Publisher for DeviceStateHandle {
    fn publish(&self, path: &str, value: f64, unit: &str) -> Result<(), PublishError> {
        let update = ItemUpdate {
            path: path.to_string(),
            value,
            unit: unit.to_string(),
        };
        self.updates.try_send(update).map_err(|e| match e {
            TrySendError::Full(update) => PublishError::QueueFull(update.path),
            TrySendError::Closed(update) => PublishError::Closed(update.path),
        })
    }
}

impl DeviceState {
    /// Creates the device state and spawns its update task. Must be called
    /// from within a tokio runtime.
    pub fn new(identity: &MeterIdentity) -> (Self, DeviceStateHandle) {
        let (tx, rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);
        let (changes, _) = broadcast::channel(CHANGE_QUEUE_DEPTH);

        let state = Self {
            items: Arc::new(Mutex::new(HashMap::new())),
            holding_registers: Arc::new(Mutex::new(sunspec_image(identity))),
            changes,
        };
        let handler_state = state.clone();
        tokio::spawn(async move {
            handler_state.handle_incoming_updates(rx).await;
        });

        (state, DeviceStateHandle { updates: tx })
    }

    async fn handle_incoming_updates(self, mut updates: Receiver<ItemUpdate>) {
        debug!("device state update task started");
        while let Some(update) = updates.recv().await {
            let item = BusItem {
                value: update.value,
                text: format_text(update.value, &update.unit),
            };
            trace!(path = %update.path, text = %item.text, "device state update");

            if let Some((register, scale)) = register_for(&update.path) {
                self.set_holding_reg_f32(register, (update.value * scale) as f32);
            }
            lock(&self.items).insert(update.path.clone(), item.clone());

            // No subscribers is fine.
            let _ = self.changes.send(ItemChanged {
                path: update.path,
                item,
            });
        }
        info!("all device state publishers dropped, update task exiting");
    }

    pub fn item(&self, path: &str) -> Option<BusItem> {
        lock(&self.items).get(path).cloned()
    }

    pub fn value(&self, path: &str) -> Option<f64> {
        lock(&self.items).get(path).map(|item| item.value)
    }

    pub fn text(&self, path: &str) -> Option<String> {
        lock(&self.items).get(path).map(|item| item.text.clone())
    }

    /// All published paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = lock(&self.items).keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ItemChanged> {
        self.changes.subscribe()
    }

    fn set_holding_reg_f32(&self, register_base_number: u16, value: f32) {
        let int_encoding = value.to_bits();
        let mut regs = lock(&self.holding_registers);
        regs.insert(register_base_number, (int_encoding >> 16) as u16);
        regs.insert(register_base_number + 1, (int_encoding & 0xFFFF) as u16);
    }
}

impl tokio_modbus::server::Service for DeviceState {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                register_read(&lock(&self.holding_registers), addr, cnt)
                    .map(Response::ReadHoldingRegisters)
            }
            _ => {
                warn!(?req, "unsupported modbus function");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

/// Identification strings of the SunSpec common block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterIdentity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub modbus_address: u16,
}

impl MeterIdentity {
    pub fn new(name: &str) -> Self {
        Self {
            manufacturer: "Victron MQTT bridge".to_string(),
            model: name.to_string(),
            serial: "00000001".to_string(),
            modbus_address: 240,
        }
    }
}

/// Register image of a SunSpec common block followed by a float meter
/// (model 213) block. Measurement registers start zeroed.
fn sunspec_image(identity: &MeterIdentity) -> HashMap<u16, u16> {
    let mut words = vec![0x5375, 0x6e53, 1, 65];
    words.extend(encode_str(&identity.manufacturer, 16));
    words.extend(encode_str(&identity.model, 16));
    words.extend(encode_str("", 8)); // options
    words.extend(encode_str(env!("CARGO_PKG_VERSION"), 8));
    words.extend(encode_str(&identity.serial, 16));
    words.push(identity.modbus_address);
    words.push(213);
    words.push(MODEL_213_LEN);
    debug_assert_eq!(SUNSPEC_BASE + words.len() as u16, MODEL_213_START);
    words.extend(std::iter::repeat(0).take(MODEL_213_LEN as usize));
    words.push(0xFFFF); // end of models
    words.push(0);

    words
        .into_iter()
        .enumerate()
        .map(|(offset, word)| (SUNSPEC_BASE + offset as u16, word))
        .collect()
}

/// Packs two ASCII characters per register, zero padded to `registers`.
fn encode_str(s: &str, registers: usize) -> Vec<u16> {
    let mut bytes: Vec<u8> = s.bytes().take(registers * 2).collect();
    bytes.resize(registers * 2, 0);
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Model 213 register and scale for a published path.
fn register_for(path: &str) -> Option<(u16, f64)> {
    let rest = path.strip_prefix("/Ac/")?;
    match rest {
        "Power" => return Some((40097, 1.0)),
        "Energy/Forward" => return Some((40137, WH_PER_KWH)),
        "Energy/Reverse" => return Some((40129, WH_PER_KWH)),
        _ => {}
    }

    let (phase, quantity) = rest.split_once('/')?;
    let number: u16 = phase.strip_prefix('L')?.parse().ok()?;
    if !(1..=3).contains(&number) {
        return None;
    }
    let offset = 2 * (number - 1);
    match quantity {
        "Current" => Some((40073 + offset, 1.0)),
        "Voltage" => Some((40081 + offset, 1.0)),
        "Power" => Some((40099 + offset, 1.0)),
        "Energy/Reverse" => Some((40131 + offset, WH_PER_KWH)),
        "Energy/Forward" => Some((40139 + offset, WH_PER_KWH)),
        _ => None,
    }
}

fn register_read(
    registers: &HashMap<u16, u16>,
    addr: u16,
    cnt: u16,
) -> Result<Vec<u16>, ExceptionCode> {
    (0..cnt)
        .map(|i| {
            let reg_addr = addr.checked_add(i).ok_or(ExceptionCode::IllegalDataAddress)?;
            registers.get(&reg_addr).copied().ok_or_else(|| {
                debug!("rejecting read of unmapped register {reg_addr}/0x{reg_addr:X}");
                ExceptionCode::IllegalDataAddress
            })
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dry-run sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, path: &str, value: f64, unit: &str) -> Result<(), PublishError> {
        debug!(path, text = %format_text(value, unit), "dry run publish");
        Ok(())
    }
}
