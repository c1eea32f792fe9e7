//! Columnar encoding for compressed chunks.
//!
//! Timestamps are delta-encoded, the low-cardinality string columns are
//! dictionary-encoded, values keep their exact IEEE-754 bits and metadata keeps
//! its stored JSON text, so decoding reproduces the input rows exactly.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};

/// Row as held in the row-oriented `readings` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredRow {
    // ---
    pub time_us: i64,
    pub device_id: String,
    pub zone_id: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub quality: i64,
    pub metadata: String,
}

#[derive(Default)]
struct Dictionary {
    // ---
    words: Vec<String>,
    index: HashMap<String, u32>,
}

impl Dictionary {
    fn code(&mut self, word: &str) -> u32 {
        if let Some(code) = self.index.get(word) {
            return *code;
        }
        let code = self.words.len() as u32;
        self.words.push(word.to_string());
        self.index.insert(word.to_string(), code);
        code
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Column {
    dict: Vec<String>,
    codes: Vec<u32>,
}

impl Column {
    fn word(&self, i: usize) -> Result<String> {
        let code = *self
            .codes
            .get(i)
            .ok_or_else(|| TelemetryError::codec("column shorter than row count"))?;
        self.dict
            .get(code as usize)
            .cloned()
            .ok_or_else(|| TelemetryError::codec(format!("dictionary code {code} out of range")))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ColumnarChunk {
    // ---
    rows: usize,
    time_deltas: Vec<i64>,
    devices: Column,
    zones: Column,
    sensors: Column,
    units: Column,
    value_bits: Vec<u64>,
    qualities: Vec<i64>,
    metadata: Vec<String>,
}

fn encode_column(values: impl Iterator<Item = String>) -> Column {
    let mut dict = Dictionary::default();
    let codes = values.map(|v| dict.code(&v)).collect();
    Column {
        dict: dict.words,
        codes,
    }
}

/// Encode rows (already in query order) into a deflated columnar payload.
pub fn encode(rows: &[StoredRow]) -> Result<Vec<u8>> {
    // ---
    let mut prev = 0i64;
    let time_deltas = rows
        .iter()
        .map(|r| {
            let delta = r.time_us - prev;
            prev = r.time_us;
            delta
        })
        .collect();

    let columnar = ColumnarChunk {
        rows: rows.len(),
        time_deltas,
        devices: encode_column(rows.iter().map(|r| r.device_id.clone())),
        zones: encode_column(rows.iter().map(|r| r.zone_id.clone())),
        sensors: encode_column(rows.iter().map(|r| r.sensor_type.clone())),
        units: encode_column(rows.iter().map(|r| r.unit.clone())),
        value_bits: rows.iter().map(|r| r.value.to_bits()).collect(),
        qualities: rows.iter().map(|r| r.quality).collect(),
        metadata: rows.iter().map(|r| r.metadata.clone()).collect(),
    };

    let json = serde_json::to_vec(&columnar).map_err(TelemetryError::codec)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(TelemetryError::codec)?;
    encoder.finish().map_err(TelemetryError::codec)
}

/// Decode a payload produced by [`encode`], preserving row order.
pub fn decode(payload: &[u8]) -> Result<Vec<StoredRow>> {
    // ---
    let mut json = Vec::new();
    ZlibDecoder::new(payload)
        .read_to_end(&mut json)
        .map_err(TelemetryError::codec)?;
    let c: ColumnarChunk = serde_json::from_slice(&json).map_err(TelemetryError::codec)?;

    if c.time_deltas.len() != c.rows
        || c.value_bits.len() != c.rows
        || c.qualities.len() != c.rows
        || c.metadata.len() != c.rows
    {
        return Err(TelemetryError::codec("column lengths disagree with row count"));
    }

    let mut rows = Vec::with_capacity(c.rows);
    let mut time_us = 0i64;
    for i in 0..c.rows {
        time_us += c.time_deltas[i];
        rows.push(StoredRow {
            time_us,
            device_id: c.devices.word(i)?,
            zone_id: c.zones.word(i)?,
            sensor_type: c.sensors.word(i)?,
            value: f64::from_bits(c.value_bits[i]),
            unit: c.units.word(i)?,
            quality: c.qualities[i],
            metadata: c.metadata[i].clone(),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn row(time_us: i64, sensor: &str, value: f64) -> StoredRow {
        StoredRow {
            time_us,
            device_id: "esp32-growroom-01".to_string(),
            zone_id: "zone-main".to_string(),
            sensor_type: sensor.to_string(),
            value,
            unit: "u".to_string(),
            quality: 100,
            metadata: "null".to_string(),
        }
    }

    #[test]
    fn test_decode_reproduces_rows_exactly() {
        // ---
        let rows = vec![
            row(1_000_000, "temperature", 24.1),
            row(1_000_000, "temperature", 24.1), // duplicate timestamp burst
            row(2_500_000, "humidity", 0.1 + 0.2),
            row(3_000_000, "co2", -0.0),
        ];

        let payload = encode(&rows).unwrap();
        let decoded = decode(&payload).unwrap();

        assert_eq!(decoded, rows);
        assert_eq!(decoded[3].value.to_bits(), (-0.0f64).to_bits());
    }

    #[test]
    fn test_repetitive_chunk_shrinks() {
        // ---
        let rows: Vec<StoredRow> = (0..2_000)
            .map(|i| row(i * 60_000_000, "temperature", 24.0 + (i % 7) as f64 * 0.1))
            .collect();
        let raw_len: usize = rows
            .iter()
            .map(|r| 8 + r.device_id.len() + r.zone_id.len() + r.sensor_type.len() + 8 + 8)
            .sum();

        let payload = encode(&rows).unwrap();
        assert!(payload.len() < raw_len / 2, "{} vs {}", payload.len(), raw_len);
    }

    #[test]
    fn test_corrupt_payload_is_codec_error() {
        // ---
        assert!(matches!(
            decode(b"not zlib at all"),
            Err(TelemetryError::Codec { .. })
        ));
    }
}
