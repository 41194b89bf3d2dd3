//! # Experiment Records and Sensor Payloads
//!
//! The experiment harness analyses two append-only CSV files after a run:
//!
//! - the **send log** (`save_file_loc`): one row per packet this node put on
//!   the wire, locally originated or forwarded, with a wall-clock timestamp
//! - the **sink log** (`sink_save_file`): one row per sensor reading
//!   delivered to the sink node
//!
//! Data payloads are 8-byte sensor readings in network byte order:
//! temperature (f32 kelvin), humidity (u8 percent), pressure (u16 hPa),
//! UV index (u8). [`MockDataGenerator`] produces a plausible random walk
//! over those fields for nodes without real sensors attached.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::identity::Identifier;
use crate::packet::Packet;

/// Wire size of an encoded [`SensorReading`].
pub const READING_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorReading {
    pub temperature_kelvin: f32,
    pub humidity_pct: u8,
    pub pressure_hpa: u16,
    pub uv_index: u8,
}

impl SensorReading {
    pub fn to_bytes(self) -> [u8; READING_SIZE] {
        let mut buf = [0u8; READING_SIZE];
        buf[0..4].copy_from_slice(&self.temperature_kelvin.to_be_bytes());
        buf[4] = self.humidity_pct;
        buf[5..7].copy_from_slice(&self.pressure_hpa.to_be_bytes());
        buf[7] = self.uv_index;
        buf
    }

    /// `None` if the payload is not exactly one encoded reading.
    pub fn from_bytes(payload: &[u8]) -> Option<Self> {
        if payload.len() != READING_SIZE {
            return None;
        }
        Some(Self {
            temperature_kelvin: f32::from_be_bytes(payload[0..4].try_into().ok()?),
            humidity_pct: payload[4],
            pressure_hpa: u16::from_be_bytes(payload[5..7].try_into().ok()?),
            uv_index: payload[7],
        })
    }
}

/// Random-walks a reading between sends so consecutive payloads look like a
/// real sensor rather than noise.
pub struct MockDataGenerator {
    last: SensorReading,
    rng: StdRng,
}

impl Default for MockDataGenerator {
    fn default() -> Self {
        Self {
            last: SensorReading {
                temperature_kelvin: 273.15,
                humidity_pct: 50,
                pressure_hpa: 900,
                uv_index: 2,
            },
            rng: StdRng::from_entropy(),
        }
    }
}

impl MockDataGenerator {
    pub fn next_reading(&mut self) -> SensorReading {
        let temperature =
            (self.last.temperature_kelvin + self.rng.gen_range(-1.0..=1.0)).max(0.0);
        let humidity = step_clamped(&mut self.rng, self.last.humidity_pct, 5, 100);
        let pressure = step_clamped(&mut self.rng, self.last.pressure_hpa, 5, u16::MAX);
        let uv = step_clamped(&mut self.rng, self.last.uv_index, 1, 12);
        self.last = SensorReading {
            temperature_kelvin: temperature,
            humidity_pct: humidity,
            pressure_hpa: pressure,
            uv_index: uv,
        };
        self.last
    }
}

fn step_clamped<T>(rng: &mut StdRng, value: T, step: i32, max: T) -> T
where
    T: Into<i64> + TryFrom<i64> + Copy,
{
    let stepped = value.into() + i64::from(rng.gen_range(-step..=step));
    let clamped = stepped.clamp(0, max.into());
    T::try_from(clamped).unwrap_or(value)
}

/// Buffered record of packets this node transmitted. Flushed to CSV by the
/// maintenance tick and at shutdown; each node writes its own file so no
/// cross-process locking is needed.
pub struct Monitor {
    node_id: Identifier,
    path: PathBuf,
    entries: Vec<PacketRecord>,
}

struct PacketRecord {
    sent_at: f64,
    packet_type: &'static str,
    forwarded: bool,
}

impl Monitor {
    pub fn new(node_id: Identifier, path: PathBuf) -> Self {
        Self {
            node_id,
            path,
            entries: Vec::new(),
        }
    }

    pub fn record_sent(&mut self, packet: &Packet, forwarded: bool) {
        self.entries.push(PacketRecord {
            sent_at: epoch_secs(),
            packet_type: if packet.is_control() { "control" } else { "data" },
            forwarded,
        });
    }

    /// Appends buffered rows to the save file, writing the header first if
    /// the file is empty.
    pub fn save(&mut self) -> io::Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "node_id,sent_at_time,packet_type,forwarded")?;
        }
        for entry in self.entries.drain(..) {
            writeln!(
                file,
                "{},{},{},{}",
                self.node_id, entry.sent_at, entry.packet_type, entry.forwarded
            )?;
        }
        Ok(())
    }
}

/// Buffered record of sensor readings delivered to the sink.
pub struct SinkLog {
    path: PathBuf,
    readings: Vec<SensorReading>,
}

impl SinkLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            readings: Vec::new(),
        }
    }

    /// Decodes and records a delivered payload. Payloads that are not a
    /// sensor reading are counted nowhere; the packet was still delivered.
    pub fn record_payload(&mut self, payload: &[u8]) {
        match SensorReading::from_bytes(payload) {
            Some(reading) => self.readings.push(reading),
            None => warn!(len = payload.len(), "delivered payload is not a sensor reading"),
        }
    }

    pub fn save(&mut self) -> io::Result<()> {
        if self.readings.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for reading in self.readings.drain(..) {
            writeln!(
                file,
                "{},{},{},{}",
                reading.temperature_kelvin,
                reading.humidity_pct,
                reading.pressure_hpa,
                reading.uv_index
            )?;
        }
        Ok(())
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Address, Locator};
    use crate::packet::PacketBody;

    #[test]
    fn reading_round_trips() {
        let reading = SensorReading {
            temperature_kelvin: 291.5,
            humidity_pct: 63,
            pressure_hpa: 1013,
            uv_index: 4,
        };
        let bytes = reading.to_bytes();
        assert_eq!(bytes.len(), READING_SIZE);
        assert_eq!(SensorReading::from_bytes(&bytes), Some(reading));
        assert_eq!(SensorReading::from_bytes(&bytes[..7]), None);
    }

    #[test]
    fn generator_stays_in_bounds() {
        let mut gen = MockDataGenerator::default();
        for _ in 0..500 {
            let reading = gen.next_reading();
            assert!(reading.temperature_kelvin >= 0.0);
            assert!(reading.humidity_pct <= 100);
            assert!(reading.uv_index <= 12);
        }
    }

    #[test]
    fn monitor_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("send.csv");
        let mut monitor = Monitor::new(Identifier(7), path.clone());

        let data = Packet::new(
            Address::new(Locator(1), Identifier(7)),
            Address::new(Locator(2), Identifier(1)),
            PacketBody::Data(vec![0; 8]),
        );
        monitor.record_sent(&data, false);
        monitor.record_sent(&data, true);
        monitor.save().unwrap();
        monitor.record_sent(&data, true);
        monitor.save().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "node_id,sent_at_time,packet_type,forwarded");
        assert!(lines[1].starts_with("7,") && lines[1].ends_with("data,false"));
        assert!(lines[2].ends_with("data,true"));
    }

    #[test]
    fn sink_log_appends_one_line_per_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.csv");
        let mut log = SinkLog::new(path.clone());

        log.record_payload(
            &SensorReading {
                temperature_kelvin: 280.0,
                humidity_pct: 40,
                pressure_hpa: 990,
                uv_index: 1,
            }
            .to_bytes(),
        );
        log.record_payload(b"bogus");
        log.save().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert_eq!(contents.lines().next().unwrap(), "280,40,990,1");
    }
}
