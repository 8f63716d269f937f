//! `SensorDriver` abstraction and its variants: local (UART/USB),
//! virtual (UDP peer), file (recording playback) and simulated
//! (bitmap ray-march). Serial-port/USB power management specifics are
//! treated as an external collaborator; `LocalDriver` here only models
//! the state machine and the bounded-queue contract, leaving vendor
//! specifics opaque behind a trait boundary.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::net::UdpSocket;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};

use crate::error::DriverError;
use crate::sample::{RawFrame, Sample};

/// Up to 128 raw samples per UDP packet.
pub const SAMPLES_PER_PACKET: usize = 128;

pub const MAGIC_SCAN: u64 = 0x1254_1254_1254_0001;
pub const MAGIC_ENV: u64 = 0x1254_1254_1254_0002;
pub const MAGIC_COMMAND: u64 = 0x1254_1254_1254_0003;

/// Common contract for any sensor variant.
pub trait SensorDriver: Send {
    fn open(&mut self) -> Result<(), DriverError>;
    fn close(&mut self);
    fn grab_frame(&mut self, timeout: Duration) -> Result<RawFrame, DriverError>;
    fn is_ready(&self) -> bool;
    fn is_powering_up(&self) -> bool;
    fn is_spinning(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalState {
    Closed,
    PoweringUp,
    Spinning,
}

/// UART/USB-attached physical sensor. The actual serial transport is
/// abstracted behind `PortIo` so tests can inject a fake without a
/// real device attached; production wiring plugs in the vendor's
/// serial implementation.
pub trait PortIo: Send {
    fn read_frame(&mut self, timeout: Duration) -> Result<RawFrame, DriverError>;
}

pub struct LocalDriver<P: PortIo> {
    port: P,
    state: LocalState,
}

impl<P: PortIo> LocalDriver<P> {
    pub fn new(port: P) -> Self {
        LocalDriver {
            port,
            state: LocalState::Closed,
        }
    }
}

impl<P: PortIo> SensorDriver for LocalDriver<P> {
    fn open(&mut self) -> Result<(), DriverError> {
        if self.state != LocalState::Closed {
            return Err(DriverError::DeviceBusy);
        }
        self.state = LocalState::PoweringUp;
        // Motor spin-up is modelled as instantaneous here; a real
        // vendor driver would poll for a "motor ready" ack.
        self.state = LocalState::Spinning;
        Ok(())
    }

    fn close(&mut self) {
        self.state = LocalState::Closed;
    }

    fn grab_frame(&mut self, timeout: Duration) -> Result<RawFrame, DriverError> {
        if self.state != LocalState::Spinning {
            return Err(DriverError::NotReady);
        }
        self.port.read_frame(timeout)
    }

    fn is_ready(&self) -> bool {
        self.state == LocalState::Spinning
    }

    fn is_powering_up(&self) -> bool {
        self.state == LocalState::PoweringUp
    }

    fn is_spinning(&self) -> bool {
        self.state == LocalState::Spinning
    }
}

/// One 8-byte wire sample.
#[derive(Debug, Clone, Copy)]
struct WireSample {
    angle_q14: u16,
    dist_mm_q2: u32,
    quality: i8,
}

impl WireSample {
    fn parse(buf: &[u8]) -> WireSample {
        WireSample {
            angle_q14: LittleEndian::read_u16(&buf[0..2]),
            dist_mm_q2: LittleEndian::read_u32(&buf[2..6]),
            quality: buf[6] as i8,
            // buf[7] is padding.
        }
    }

    fn to_sample(self) -> Sample {
        let angle = self.angle_q14 as f32 / (1 << 14) as f32 * std::f32::consts::TAU;
        let distance = self.dist_mm_q2 as f32 / 4.0 / 1000.0;
        Sample {
            angle,
            distance,
            quality: self.quality as i32,
        }
    }
}

struct InProgressScan {
    packets: HashMap<u8, Vec<Sample>>,
    packets_per_scan: u8,
    total_samples: u16,
}

/// Virtual (UDP peer) sensor: reassembles fragmented scan packets by
/// sequence id. An incomplete scan older than the most recently
/// completed one is discarded.
pub struct VirtualDriver {
    socket: Option<UdpSocket>,
    bind_addr: std::net::SocketAddr,
    connected: bool,
    last_completed_seq: Option<u64>,
    in_progress: HashMap<u64, InProgressScan>,
    sequence_counter: u64,
}

impl VirtualDriver {
    pub fn new(bind_addr: std::net::SocketAddr) -> Self {
        VirtualDriver {
            socket: None,
            bind_addr,
            connected: false,
            last_completed_seq: None,
            in_progress: HashMap::new(),
            sequence_counter: 0,
        }
    }

    /// Handle one received datagram; returns a completed `RawFrame`
    /// once all packets for a scan have arrived.
    fn handle_datagram(&mut self, buf: &[u8]) -> Result<Option<RawFrame>, DriverError> {
        if buf.len() < 8 {
            return Err(DriverError::IOError("datagram too short for magic".into()));
        }
        let magic = LittleEndian::read_u64(&buf[0..8]);
        match magic {
            MAGIC_SCAN | MAGIC_ENV => self.handle_scan_packet(&buf[8..]),
            MAGIC_COMMAND => {
                self.handle_command_packet(&buf[8..]);
                Ok(None)
            }
            other => {
                warn!("unrecognised magic 0x{:016x}, discarding datagram", other);
                Ok(None)
            }
        }
    }

    fn handle_scan_packet(&mut self, payload: &[u8]) -> Result<Option<RawFrame>, DriverError> {
        if payload.len() < 12 {
            return Err(DriverError::IOError("scan header truncated".into()));
        }
        let seq_nr = LittleEndian::read_u64(&payload[0..8]);
        let packet_id = payload[8];
        let packets_per_scan = payload[9];
        let total_samples = LittleEndian::read_u16(&payload[10..12]);

        if let Some(last) = self.last_completed_seq {
            if seq_nr < last {
                trace!("dropping stale scan fragment seq {} (last completed {})", seq_nr, last);
                return Ok(None);
            }
        }

        let samples_buf = &payload[12..];
        let n_samples = (samples_buf.len() / 8).min(SAMPLES_PER_PACKET);
        let mut samples = Vec::with_capacity(n_samples);
        for i in 0..n_samples {
            let s = &samples_buf[i * 8..i * 8 + 8];
            samples.push(WireSample::parse(s).to_sample());
        }

        let entry = self.in_progress.entry(seq_nr).or_insert_with(|| InProgressScan {
            packets: HashMap::new(),
            packets_per_scan,
            total_samples,
        });
        entry.packets.insert(packet_id, samples);

        if entry.packets.len() as u8 >= entry.packets_per_scan {
            let mut scan = self.in_progress.remove(&seq_nr).unwrap();
            let mut ordered_ids: Vec<u8> = scan.packets.keys().copied().collect();
            ordered_ids.sort_unstable();
            let mut all_samples = Vec::with_capacity(scan.total_samples as usize);
            for id in ordered_ids {
                all_samples.extend(scan.packets.remove(&id).unwrap());
            }

            // Discard any older in-progress scans now that this one completed.
            self.in_progress.retain(|&k, _| k > seq_nr);
            self.last_completed_seq = Some(seq_nr);

            let now_ms = crate::device_set::now_ms();
            return Ok(Some(RawFrame::new(now_ms, seq_nr, all_samples)));
        }
        Ok(None)
    }

    fn handle_command_packet(&mut self, payload: &[u8]) {
        if payload.len() < 2 {
            return;
        }
        let size = LittleEndian::read_u16(&payload[0..2]) as usize;
        let text = String::from_utf8_lossy(&payload[2..2 + size.min(payload.len() - 2)]);
        debug!("virtual sensor command: {}", text);
        match text.as_ref() {
            "connect" => self.connected = true,
            "motorOn" | "motorOff" | "startPowerUp" | "finishPowerUp" | "outEnvOn"
            | "outEnvOff" | "connectAcknowledge" => {}
            other if other.starts_with("deviceType=") => {}
            _ => warn!("unrecognised virtual-sensor command: {}", text),
        }
    }
}

impl SensorDriver for VirtualDriver {
    fn open(&mut self) -> Result<(), DriverError> {
        let socket = UdpSocket::bind(self.bind_addr)
            .map_err(|e| DriverError::IOError(e.to_string()))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .map_err(|e| DriverError::IOError(e.to_string()))?;
        self.socket = Some(socket);
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
        self.connected = false;
        self.in_progress.clear();
    }

    fn grab_frame(&mut self, timeout: Duration) -> Result<RawFrame, DriverError> {
        let socket = self.socket.as_ref().ok_or(DriverError::Closed)?;
        socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| DriverError::IOError(e.to_string()))?;
        let mut buf = [0u8; 2048];
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match socket.recv(&mut buf) {
                Ok(n) => {
                    if let Some(frame) = self.handle_datagram(&buf[..n])? {
                        return Ok(frame);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Err(DriverError::Timeout);
                }
                Err(e) => return Err(DriverError::IOError(e.to_string())),
            }
            if std::time::Instant::now() >= deadline {
                return Err(DriverError::Timeout);
            }
            self.sequence_counter += 1;
        }
    }

    fn is_ready(&self) -> bool {
        self.connected
    }

    fn is_powering_up(&self) -> bool {
        false
    }

    fn is_spinning(&self) -> bool {
        self.connected
    }
}

/// Recording playback driver: reads serialised `RawFrame`s (one JSON
/// object per line) from a file, emitting `Closed` at end of file.
pub struct FileDriver {
    path: std::path::PathBuf,
    reader: Option<BufReader<std::fs::File>>,
}

impl FileDriver {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        FileDriver {
            path: path.into(),
            reader: None,
        }
    }
}

impl SensorDriver for FileDriver {
    fn open(&mut self) -> Result<(), DriverError> {
        let file = std::fs::File::open(&self.path)
            .map_err(|e| DriverError::IOError(e.to_string()))?;
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn close(&mut self) {
        self.reader = None;
    }

    fn grab_frame(&mut self, _timeout: Duration) -> Result<RawFrame, DriverError> {
        let reader = self.reader.as_mut().ok_or(DriverError::Closed)?;
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| DriverError::IOError(e.to_string()))?;
        if n == 0 {
            return Err(DriverError::Closed);
        }
        serde_json::from_str(&line).map_err(|e| DriverError::IOError(e.to_string()))
    }

    fn is_ready(&self) -> bool {
        self.reader.is_some()
    }

    fn is_powering_up(&self) -> bool {
        false
    }

    fn is_spinning(&self) -> bool {
        self.reader.is_some()
    }
}

/// Synthesizes samples by ray-marching against a greyscale bitmap;
/// obstacles are dark pixels, free space is light.
pub struct SimulatedDriver {
    image: image::GrayImage,
    world_extent_m: f32,
    centre: (f32, f32),
    num_rays: usize,
    sequence_id: u64,
    open: bool,
}

impl SimulatedDriver {
    pub fn new(image: image::GrayImage, world_extent_m: f32, num_rays: usize) -> Self {
        let (w, h) = image.dimensions();
        SimulatedDriver {
            image,
            world_extent_m,
            centre: (w as f32 / 2.0, h as f32 / 2.0),
            num_rays,
            sequence_id: 0,
            open: false,
        }
    }

    fn pixels_per_metre(&self) -> f32 {
        let (w, _h) = self.image.dimensions();
        w as f32 / self.world_extent_m
    }

    fn march(&self, angle: f32) -> (f32, i32) {
        let ppm = self.pixels_per_metre();
        let (w, h) = self.image.dimensions();
        let max_r = self.world_extent_m;
        let step = 1.0 / ppm;
        let mut r = 0.0f32;
        while r < max_r {
            let px = self.centre.0 + r * ppm * angle.cos();
            let py = self.centre.1 + r * ppm * angle.sin();
            if px < 0.0 || py < 0.0 || px >= w as f32 || py >= h as f32 {
                return (max_r, 0);
            }
            let pixel = self.image.get_pixel(px as u32, py as u32).0[0];
            if pixel < 128 {
                return (r, 255);
            }
            r += step;
        }
        (max_r, 0)
    }
}

impl SensorDriver for SimulatedDriver {
    fn open(&mut self) -> Result<(), DriverError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn grab_frame(&mut self, _timeout: Duration) -> Result<RawFrame, DriverError> {
        if !self.open {
            return Err(DriverError::NotReady);
        }
        let mut samples = Vec::with_capacity(self.num_rays);
        for i in 0..self.num_rays {
            let angle = i as f32 / self.num_rays as f32 * std::f32::consts::TAU;
            let (distance, quality) = self.march(angle);
            samples.push(Sample {
                angle,
                distance,
                quality,
            });
        }
        self.sequence_id += 1;
        Ok(RawFrame::new(crate::device_set::now_ms(), self.sequence_id, samples))
    }

    fn is_ready(&self) -> bool {
        self.open
    }

    fn is_powering_up(&self) -> bool {
        false
    }

    fn is_spinning(&self) -> bool {
        self.open
    }
}

/// Reads raw bytes off any `Read` (used by tests to simulate `PortIo`
/// without a real vendor driver present).
pub struct FramedPortIo<R: Read + Send> {
    reader: R,
    sequence_id: u64,
}

impl<R: Read + Send> FramedPortIo<R> {
    pub fn new(reader: R) -> Self {
        FramedPortIo {
            reader,
            sequence_id: 0,
        }
    }
}

impl<R: Read + Send> PortIo for FramedPortIo<R> {
    fn read_frame(&mut self, _timeout: Duration) -> Result<RawFrame, DriverError> {
        let mut header = [0u8; 2];
        self.reader
            .read_exact(&mut header)
            .map_err(|e| DriverError::IOError(e.to_string()))?;
        let n = LittleEndian::read_u16(&header) as usize;
        let mut buf = vec![0u8; n * 8];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| DriverError::IOError(e.to_string()))?;
        let samples = (0..n)
            .map(|i| WireSample::parse(&buf[i * 8..i * 8 + 8]).to_sample())
            .collect();
        self.sequence_id += 1;
        Ok(RawFrame::new(crate::device_set::now_ms(), self.sequence_id, samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_driver_drops_stale_fragment_after_newer_scan_completes() {
        let mut driver = VirtualDriver::new("127.0.0.1:0".parse().unwrap());

        // Complete scan seq=2 first (single packet).
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u64.to_le_bytes()); // seqNr
        payload.push(1); // packetId
        payload.push(1); // packetsPerScan
        payload.extend_from_slice(&0u16.to_le_bytes()); // totalSamples
        driver.handle_scan_packet(&payload).unwrap();
        assert_eq!(driver.last_completed_seq, Some(2));

        // Now an older, incomplete fragment for seq=1 should be dropped.
        let mut stale = Vec::new();
        stale.extend_from_slice(&1u64.to_le_bytes());
        stale.push(1);
        stale.push(2); // expects 2 packets, will never complete
        stale.extend_from_slice(&0u16.to_le_bytes());
        let result = driver.handle_scan_packet(&stale).unwrap();
        assert!(result.is_none());
        assert!(driver.in_progress.is_empty());
    }

    #[test]
    fn wire_sample_round_trips_angle_and_distance() {
        let angle_q14 = ((std::f32::consts::PI / (1 << 14) as f32).recip()) as u16; // arbitrary
        let _ = angle_q14;
        let ws = WireSample {
            angle_q14: 1 << 13, // half of 2*PI range -> PI
            dist_mm_q2: 4000, // 4000 / 4 = 1000mm = 1m
            quality: 50,
        };
        let s = ws.to_sample();
        assert!((s.angle - std::f32::consts::PI).abs() < 1e-3);
        assert!((s.distance - 1.0).abs() < 1e-3);
        assert_eq!(s.quality, 50);
    }
}
