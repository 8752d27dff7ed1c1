//! Snapshot de telemetria e montagem a partir das respostas do PX100.
//!
//! O PX100 é pergunta/resposta: cada frame carrega uma única grandeza.
//! O [`SnapshotAssembler`] junta as respostas de um ciclo de polling em um
//! [`TelemetrySnapshot`] imutável, consumido pelo motor de alertas.

use crate::protocol::{Command, ResponseRecord};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ──────────────────────────────────────────────
// Snapshot
// ──────────────────────────────────────────────

/// Estado decodificado da carga em um ciclo de leitura.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySnapshot {
    /// Tensão (V)
    pub voltage: f64,
    /// Corrente (A)
    pub current: f64,
    /// Potência (W)
    pub power: f64,
    /// Capacidade acumulada (mAh)
    pub capacity_mah: f64,
    /// Energia acumulada (Wh)
    pub energy_wh: f64,
    /// Temperatura interna (°C)
    pub temperature_c: i32,
    /// Sonda externa (°C)
    pub ext_temperature_c: i32,
    pub load_on: bool,
    pub overcurrent: bool,
    pub overvoltage: bool,
    pub overtemperature: bool,
    /// Velocidade aproximada do fan (RPM)
    pub fan_rpm: u32,
}

impl std::fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.load_on { "ON" } else { "OFF" };
        write!(
            f,
            "DL24P [{state}]: {:.2}V @ {:.3}A = {:.2}W | {:.0}mAh / {:.2}Wh | Temp: {}°C",
            self.voltage, self.current, self.power, self.capacity_mah, self.energy_wh, self.temperature_c
        )
    }
}

// ──────────────────────────────────────────────
// Montagem
// ──────────────────────────────────────────────

/// Consultas enviadas a cada ciclo de polling, em ordem.
pub const POLL_CYCLE: [Command; 6] = [
    Command::GetOnOff,
    Command::GetVoltage,
    Command::GetCurrent,
    Command::GetCapacity,
    Command::GetEnergy,
    Command::GetTemperature,
];

/// Valores parciais de um ciclo, indexados pela posição em [`POLL_CYCLE`].
#[derive(Debug, Default)]
pub struct SnapshotAssembler {
    values: [Option<u32>; POLL_CYCLE.len()],
}

impl SnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra uma resposta. Retorna o snapshot quando o ciclo completa.
    pub fn ingest(&mut self, record: &ResponseRecord) -> Option<TelemetrySnapshot> {
        let command = record.command();
        let Some(slot) = POLL_CYCLE.iter().position(|c| *c == command) else {
            debug!("Resposta fora do ciclo de polling ignorada: {command:?}");
            return None;
        };
        self.values[slot] = Some(record.raw_value);

        if self.values.iter().all(Option::is_some) {
            let snapshot = self.build();
            self.reset();
            Some(snapshot)
        } else {
            None
        }
    }

    /// Descarta o ciclo parcial.
    pub fn reset(&mut self) {
        self.values = Default::default();
    }

    fn raw(&self, command: Command) -> u32 {
        POLL_CYCLE
            .iter()
            .position(|c| *c == command)
            .and_then(|i| self.values[i])
            .unwrap_or(0)
    }

    fn build(&self) -> TelemetrySnapshot {
        let voltage = f64::from(self.raw(Command::GetVoltage)) / 1000.0;
        let current = f64::from(self.raw(Command::GetCurrent)) / 1000.0;
        TelemetrySnapshot {
            voltage,
            current,
            power: voltage * current,
            capacity_mah: f64::from(self.raw(Command::GetCapacity)),
            energy_wh: f64::from(self.raw(Command::GetEnergy)) / 1000.0,
            // 24 bits sempre cabem em i32
            temperature_c: self.raw(Command::GetTemperature) as i32,
            load_on: self.raw(Command::GetOnOff) != 0,
            ..Default::default()
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_response;

    fn record(cmd: Command, value: u32) -> ResponseRecord {
        let [_, d1, d2, d3] = value.to_be_bytes();
        parse_response(&[0xCA, 0xCB, u8::from(cmd), d1, d2, d3, 0xCE, 0xCF]).unwrap()
    }

    fn full_cycle() -> Vec<ResponseRecord> {
        vec![
            record(Command::GetOnOff, 1),
            record(Command::GetVoltage, 3_700),
            record(Command::GetCurrent, 500),
            record(Command::GetCapacity, 1_234),
            record(Command::GetEnergy, 4_560),
            record(Command::GetTemperature, 41),
        ]
    }

    #[test]
    fn default_snapshot_is_zeroed() {
        let s = TelemetrySnapshot::default();
        assert_eq!(s.voltage, 0.0);
        assert!(!s.load_on);
        assert!(!s.overcurrent);
    }

    #[test]
    fn full_cycle_emits_scaled_snapshot() {
        let mut asm = SnapshotAssembler::new();
        let records = full_cycle();
        let (last, head) = records.split_last().unwrap();
        for r in head {
            assert!(asm.ingest(r).is_none());
        }

        let s = asm.ingest(last).expect("ciclo completo");
        assert!(s.load_on);
        assert!((s.voltage - 3.7).abs() < 1e-9);
        assert!((s.current - 0.5).abs() < 1e-9);
        assert!((s.power - 1.85).abs() < 1e-9);
        assert_eq!(s.capacity_mah, 1234.0);
        assert!((s.energy_wh - 4.56).abs() < 1e-9);
        assert_eq!(s.temperature_c, 41);
    }

    #[test]
    fn cycle_restarts_after_emit() {
        let mut asm = SnapshotAssembler::new();
        for r in &full_cycle() {
            asm.ingest(r);
        }
        // Uma única resposta não completa o próximo ciclo
        assert!(asm.ingest(&record(Command::GetVoltage, 3_600)).is_none());
    }

    #[test]
    fn latest_value_wins_within_cycle() {
        let mut asm = SnapshotAssembler::new();
        asm.ingest(&record(Command::GetVoltage, 4_000));
        let mut snapshot = None;
        for r in &full_cycle() {
            snapshot = asm.ingest(r).or(snapshot);
        }
        assert!((snapshot.unwrap().voltage - 3.7).abs() < 1e-9);
    }

    #[test]
    fn ignores_commands_outside_cycle() {
        let mut asm = SnapshotAssembler::new();
        assert!(asm.ingest(&record(Command::GetCutoff, 300)).is_none());
        assert!(asm.ingest(&record(Command::Unknown(0x7F), 1)).is_none());
    }

    #[test]
    fn display_summary() {
        let s = TelemetrySnapshot {
            voltage: 3.7,
            current: 0.5,
            load_on: true,
            ..Default::default()
        };
        assert!(s.to_string().starts_with("DL24P [ON]: 3.70V @ 0.500A"));
    }
}
