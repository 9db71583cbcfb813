//! The device controller: opens and owns the serial link, runs the transport
//! listener, correlates commands with replies, and emits capture records.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, trace};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialStream, StopBits};

use crate::crc;
use crate::frame::{cmds, prepare, Frame, FrameSplitter};
use crate::pipe;
use crate::timing::{host_millis, DeviceFamily, TimingState, PRECISION_BASE_US};

/// Serial parameters the firmware expects: 460800 baud, 8-N-1, no flow
/// control, DTR deasserted.
pub const BAUD_RATE: u32 = 460_800;

/// Bytes drained from the port per readiness wakeup.
const READ_SCRATCH: usize = 1024;

/// Pause after each outgoing frame; the firmware's intake buffer is small.
const WRITE_PACING: Duration = Duration::from_millis(25);

/// How long a command waits for the device to answer.
const REPLY_TIMEOUT: Duration = Duration::from_millis(75);

/// Gap between the two reset pulses the firmware needs to latch a reset.
const RESET_PULSE_GAP: Duration = Duration::from_millis(75);

/// The firmware caps outgoing messages at 13 bytes.
const MESSAGE_BODY_LEN: usize = 13;

const CAPTURE_HEADER_LEN: usize = 8;
const FCS_LEN: usize = 2;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no such port: {0}")]
    NoSuchPort(String),
    #[error("port in use: {0}")]
    PortInUse(String),
    #[error("unsupported configuration on {port}: {source}")]
    UnsupportedConfig {
        port: String,
        source: tokio_serial::Error,
    },
}

/// Session state owned by the controller. Reset wholesale on disconnect.
#[derive(Default)]
struct Session {
    connected: bool,
    port: Option<String>,
    family: DeviceFamily,
    channel: Option<u8>,
    enabled: bool,
    timing: TimingState,
    waiter: Option<oneshot::Sender<Frame>>,
    listeners: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    session: Mutex<Session>,
    writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
}

/// Handle on one sniffer device. Clones share the same session, so the
/// control flow, the transport listener, and the stdin listener all talk to
/// a single state machine.
#[derive(Clone, Default)]
pub struct Sniffer {
    inner: Arc<Inner>,
}

impl Sniffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner.session.lock().unwrap()
    }

    pub fn connected(&self) -> bool {
        self.session().connected
    }

    /// Whether the device acknowledged being in capture mode.
    pub fn enabled(&self) -> bool {
        self.session().enabled
    }

    /// The channel the transceiver last accepted, if any.
    pub fn current_channel(&self) -> Option<u8> {
        self.session().channel
    }

    pub fn family(&self) -> DeviceFamily {
        self.session().family
    }

    /// Opens the named serial port and starts the transport and stdin
    /// listeners. A no-op when already connected.
    pub async fn connect(&self, port: &str) -> Result<(), DeviceError> {
        if self.connected() {
            return Ok(());
        }

        let known = tokio_serial::available_ports()
            .map(|ports| ports.iter().any(|p| p.port_name == port))
            .unwrap_or(false);
        if !known {
            return Err(DeviceError::NoSuchPort(port.to_string()));
        }

        let builder = tokio_serial::new(port, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None);
        let mut stream = SerialStream::open(&builder).map_err(|e| match e.kind.clone() {
            tokio_serial::ErrorKind::NoDevice => DeviceError::NoSuchPort(port.to_string()),
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                DeviceError::PortInUse(port.to_string())
            }
            _ => DeviceError::UnsupportedConfig {
                port: port.to_string(),
                source: e,
            },
        })?;
        stream
            .write_data_terminal_ready(false)
            .map_err(|e| DeviceError::UnsupportedConfig {
                port: port.to_string(),
                source: e,
            })?;

        self.attach(stream).await;

        let mut session = self.session();
        session.port = Some(port.to_string());
        let pipe_task = tokio::spawn(pipe::run(self.clone()));
        session.listeners.push(pipe_task);
        Ok(())
    }

    /// Takes ownership of an open stream and spawns the transport listener.
    pub(crate) async fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        *self.inner.writer.lock().await = Some(Box::new(write_half));

        let listener = tokio::spawn(self.clone().listen(read_half));
        let mut session = self.session();
        session.connected = true;
        session.listeners.push(listener);
    }

    /// The transport listener: drains the port as bytes become available and
    /// hands every validated frame to [`receive`](Self::receive). Ends when
    /// the port closes or fails.
    async fn listen<R>(self, mut port: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut splitter = FrameSplitter::new();
        let mut scratch = [0u8; READ_SCRATCH];
        loop {
            match port.read(&mut scratch).await {
                Ok(0) => break,
                Ok(n) => {
                    trace!("serial delivered {n} bytes");
                    for frame in splitter.push(&scratch[..n]) {
                        self.receive(frame);
                    }
                }
                Err(e) => {
                    debug!("serial read ended: {e}");
                    break;
                }
            }
        }
    }

    /// Dispatches one validated inbound frame.
    ///
    /// Every frame, captures included, also completes the pending command
    /// waiter: the firmware interleaves capture notifications with command
    /// replies on the same line, and any traffic proves the device alive.
    pub fn receive(&self, frame: Frame) {
        let mut record = None;
        {
            let mut session = self.session();
            match frame.command {
                cmds::DATA_CAPTURED => {
                    let stamp = host_millis();
                    let family = session.family;
                    record =
                        CaptureRecord::decode(&frame.payload, stamp, family, &mut session.timing);
                }
                cmds::REPLY_SET_CHANNEL_CHANNELPAGE => {
                    // 0xFA marks a channel the transceiver refused.
                    if let Some(&value) = frame.payload.first() {
                        if value != 0xFA {
                            session.channel = Some(value);
                        }
                    }
                }
                cmds::REPLY_AQUIRE_STATUS => {
                    if let Some(family) = frame
                        .payload
                        .first()
                        .and_then(|b| DeviceFamily::from_status_byte(*b))
                    {
                        session.family = family;
                    }
                }
                _ => {}
            }
            if let Some(tx) = session.waiter.take() {
                let _ = tx.send(frame);
            }
        }

        if let Some(record) = record {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{record}");
        }
    }

    /// Arms the reply slot for a request about to go out.
    fn arm(&self) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.session().waiter = Some(tx);
        rx
    }

    fn disarm(&self) {
        self.session().waiter = None;
    }

    /// Writes one frame to the port. Transport failures degrade to `false`;
    /// the caller observes them as a command without a reply.
    async fn transmit(&self, bytes: &[u8]) -> bool {
        let mut writer = self.inner.writer.lock().await;
        let Some(port) = writer.as_mut() else {
            return false;
        };
        trace!("sending frame: {:02x?}", bytes);
        if let Err(e) = port.write_all(bytes).await {
            debug!("serial write failed: {e}");
            return false;
        }
        if let Err(e) = port.flush().await {
            debug!("serial flush failed: {e}");
            return false;
        }
        sleep(WRITE_PACING).await;
        true
    }

    async fn await_reply(&self, rx: oneshot::Receiver<Frame>) -> Option<Frame> {
        match timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(frame)) => Some(frame),
            _ => {
                self.disarm();
                None
            }
        }
    }

    /// Sends a command frame and waits for the next inbound frame.
    async fn request(&self, command: u8, payload: &[u8]) -> Option<Frame> {
        let Ok(bytes) = prepare(command, payload) else {
            return None;
        };
        let rx = self.arm();
        if !self.transmit(&bytes).await {
            self.disarm();
            return None;
        }
        self.await_reply(rx).await
    }

    /// Resets the device with the double pulse its firmware requires.
    /// Succeeds iff any frame arrives after the second pulse.
    pub async fn reset(&self) -> bool {
        if !self.connected() {
            return false;
        }
        let Ok(pulse) = prepare(cmds::RESET_DEVICE, &[]) else {
            return false;
        };
        if !self.transmit(&pulse).await {
            return false;
        }
        sleep(RESET_PULSE_GAP).await;

        let rx = self.arm();
        if !self.transmit(&pulse).await {
            self.disarm();
            return false;
        }
        self.await_reply(rx).await.is_some()
    }

    /// Queries device status; the reply byte identifies the hardware family.
    pub async fn status(&self) -> bool {
        self.request(cmds::AQUIRE_STATUS, &[]).await.is_some()
    }

    /// Selects a capture channel on page 0.
    pub async fn channel(&self, value: i32) -> bool {
        self.channel_on_page(value, 0).await
    }

    /// Selects a capture channel on the given channel page. Out-of-range
    /// values are rejected before anything reaches the device. Whether the
    /// transceiver accepted the channel shows up in
    /// [`current_channel`](Self::current_channel), not the return value.
    pub async fn channel_on_page(&self, value: i32, page: i32) -> bool {
        if !channel_in_range(value, page) {
            return false;
        }
        self.request(cmds::SET_CHANNEL_CHANNELPAGE, &[value as u8, page as u8])
            .await
            .is_some()
    }

    /// Turns capturing on or off. State flips only when the device answers;
    /// the return value is the resulting state, not the requested one.
    pub async fn enable(&self, value: bool) -> bool {
        let command = if value {
            cmds::ENABLE_CAPTURE
        } else {
            cmds::DISABLE_CAPTURE
        };
        if self.request(command, &[]).await.is_some() {
            self.session().enabled = value;
        }
        self.enabled()
    }

    /// Transmits a message on `channel`. The body is always 13 bytes:
    /// longer input is truncated, shorter input zero-padded. Returns whether
    /// the frame went out; an acknowledging device rests on the transmit
    /// channel afterwards, which is mirrored into the session.
    pub async fn send(&self, channel: i32, msg: &[u8]) -> bool {
        let mut body = Vec::with_capacity(4 + MESSAGE_BODY_LEN);
        body.extend_from_slice(&[0xFF, channel as u8, 0xFF, 0xFF]);
        let take = msg.len().min(MESSAGE_BODY_LEN);
        body.extend_from_slice(&msg[..take]);
        body.resize(4 + MESSAGE_BODY_LEN, 0);

        let Ok(bytes) = prepare(cmds::SEND_MESSAGE, &body) else {
            return false;
        };
        let rx = self.arm();
        if !self.transmit(&bytes).await {
            self.disarm();
            return false;
        }
        if self.await_reply(rx).await.is_some() {
            self.session().channel = Some(channel as u8);
        }
        true
    }

    /// Stops the listeners, closes the port, and clears the session.
    /// Callable any number of times.
    pub async fn disconnect(&self) {
        let old = {
            let mut session = self.session();
            std::mem::take(&mut *session)
        };
        for task in old.listeners {
            task.abort();
        }
        *self.inner.writer.lock().await = None;
    }

    /// Renders the session the way the firmware tooling always has:
    /// `{device={type=..,channel=..,serial={..}}}`, with empty fields while
    /// disconnected.
    pub fn status_line(&self) -> String {
        let session = self.session();
        if !session.connected {
            return concat!(
                "{device={type=,channel=,serial={port=,",
                "settings={baudrate=,databits=,stopbits=,parity=},flowcontrol=}}}"
            )
            .to_string();
        }
        format!(
            "{{device={{type={},channel={},serial={{port={},settings={{baudrate={},databits=8,stopbits=1,parity=none}},flowcontrol=none}}}}}}",
            session.family,
            session.channel.map(|c| c.to_string()).unwrap_or_default(),
            session.port.as_deref().unwrap_or(""),
            BAUD_RATE,
        )
    }
}

/// Channel plan: page 0 spans 868 MHz (channel 0), 915 MHz (1-10) and
/// 2.4 GHz (11-26); pages 1 and 2 only reach channels 0-10.
pub fn channel_in_range(channel: i32, page: i32) -> bool {
    match page {
        0 => (0..=26).contains(&channel),
        1 | 2 => (0..=10).contains(&channel),
        _ => false,
    }
}

/// One decoded capture notification: built, printed, dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub channel: u8,
    pub host_stamp_ms: u64,
    pub delta_us: u64,
    pub mac: Vec<u8>,
    pub fcs: [u8; 2],
    pub fcs_ok: bool,
}

impl CaptureRecord {
    /// Decodes a `DATA_CAPTURED` payload: an 8-byte header carrying the
    /// timer bytes and the receive channel (byte 5), then the raw MAC frame,
    /// then the trailing FCS. Payloads too short for that shape are noise.
    pub fn decode(
        payload: &[u8],
        stamp_ms: u64,
        family: DeviceFamily,
        timing: &mut TimingState,
    ) -> Option<Self> {
        if payload.len() < CAPTURE_HEADER_LEN + FCS_LEN {
            return None;
        }
        let mut header = [0u8; CAPTURE_HEADER_LEN];
        header.copy_from_slice(&payload[..CAPTURE_HEADER_LEN]);

        let raw = family.timer_value(&header);
        let delta_us = timing.recover(family, raw, stamp_ms);

        let mac = payload[CAPTURE_HEADER_LEN..payload.len() - FCS_LEN].to_vec();
        let fcs = [payload[payload.len() - FCS_LEN], payload[payload.len() - 1]];
        let fcs_ok = crc::fcs(&mac) == fcs;

        Some(Self {
            channel: header[5],
            host_stamp_ms: stamp_ms,
            delta_us,
            mac,
            fcs,
            fcs_ok,
        })
    }
}

impl fmt::Display for CaptureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>2} {:>13} {:>width$} {}{}",
            self.channel,
            self.host_stamp_ms,
            self.delta_us,
            hex::encode(&self.mac),
            hex::encode(self.fcs),
            width = PRECISION_BASE_US,
        )?;
        if !self.fcs_ok {
            write!(f, " *")?;
        }
        Ok(())
    }
}
