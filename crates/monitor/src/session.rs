//! Estado da sessão de teste: buffer de frames, montagem e alertas.
//!
//! Pertence inteiramente ao loop principal; nada aqui é compartilhado.

use bench_core::alerts::{AlertEngine, AlertResult};
use bench_core::protocol::FrameBuffer;
use bench_core::scheduler::ScheduledJob;
use bench_core::types::{SnapshotAssembler, TelemetrySnapshot};
use tracing::{debug, info};

#[derive(Debug)]
pub struct Session {
    frames: FrameBuffer,
    assembler: SnapshotAssembler,
    engine: AlertEngine,
    last_snapshot: Option<TelemetrySnapshot>,
    snapshots: u64,
    alerts: u64,
}

impl Session {
    pub fn new(engine: AlertEngine) -> Self {
        Self {
            frames: FrameBuffer::new(),
            assembler: SnapshotAssembler::new(),
            engine,
            last_snapshot: None,
            snapshots: 0,
            alerts: 0,
        }
    }

    /// Processa um chunk do transporte. Retorna os alertas emitidos.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<AlertResult> {
        self.frames.extend(chunk);

        let mut fired = Vec::new();
        while let Some(record) = self.frames.next_record() {
            let Some(snapshot) = self.assembler.ingest(&record) else {
                continue;
            };
            debug!("{snapshot}");
            self.snapshots += 1;
            fired.extend(self.engine.check(&snapshot));
            self.last_snapshot = Some(snapshot);
        }

        self.alerts += fired.len() as u64;
        fired
    }

    /// Nova sessão de teste: condições rearmadas e ciclo parcial descartado.
    pub fn begin(&mut self, job: &ScheduledJob) {
        info!(
            "Nova sessão: {} ({}) {}",
            job.payload.profile_path.display(),
            job.payload.battery_name,
            job.payload.notes
        );
        self.engine.reset_all();
        self.assembler.reset();
    }

    pub fn last_snapshot(&self) -> Option<&TelemetrySnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn snapshot_count(&self) -> u64 {
        self.snapshots
    }

    pub fn alert_count(&self) -> u64 {
        self.alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::alerts::{AlertSeverity, Condition, TemperatureAlert, TestCompleteAlert};
    use bench_core::protocol::Command;
    use bench_core::scheduler::{JobId, JobPayload};
    use bench_core::types::POLL_CYCLE;
    use chrono::{Local, TimeDelta};

    fn job() -> ScheduledJob {
        ScheduledJob {
            id: JobId::new("nightly"),
            due_time: Local::now(),
            payload: JobPayload::new("p.json").with_battery("Cell A"),
            repeat_interval: Some(TimeDelta::hours(24)),
        }
    }

    fn frame(cmd: Command, value: u32) -> [u8; 8] {
        let [_, d1, d2, d3] = value.to_be_bytes();
        [0xCA, 0xCB, u8::from(cmd), d1, d2, d3, 0xCE, 0xCF]
    }

    fn cycle(on: bool, temp: u32) -> Vec<u8> {
        POLL_CYCLE
            .iter()
            .flat_map(|&cmd| {
                let value = match cmd {
                    Command::GetOnOff => u32::from(on),
                    Command::GetVoltage => 3_700,
                    Command::GetCurrent => 1_000,
                    Command::GetTemperature => temp,
                    _ => 0,
                };
                frame(cmd, value)
            })
            .collect()
    }

    fn session() -> Session {
        let mut engine = AlertEngine::new();
        engine.add(TemperatureAlert::new(70));
        engine.add(TestCompleteAlert::new());
        Session::new(engine)
    }

    #[test]
    fn split_chunks_build_one_snapshot() {
        let mut s = session();
        let bytes = cycle(true, 40);
        let (a, b) = bytes.split_at(13);

        assert!(s.feed(a).is_empty());
        assert_eq!(s.snapshot_count(), 0);
        assert!(s.feed(b).is_empty());
        assert_eq!(s.snapshot_count(), 1);
        assert!((s.last_snapshot().unwrap().power - 3.7).abs() < 1e-9);
    }

    #[test]
    fn noise_between_frames_is_skipped() {
        let mut s = session();
        let mut bytes = vec![0x00, 0xFF, 0x13];
        bytes.extend(cycle(true, 40));
        s.feed(&bytes);
        assert_eq!(s.snapshot_count(), 1);
    }

    #[test]
    fn alerts_flow_out_of_feed() {
        let mut s = session();
        assert!(s.feed(&cycle(true, 40)).is_empty());

        let hot = s.feed(&cycle(true, 75));
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].severity, AlertSeverity::Error);

        let done = s.feed(&cycle(false, 40));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].severity, AlertSeverity::Info);
        assert_eq!(s.alert_count(), 2);
    }

    #[test]
    fn begin_rearms_conditions() {
        let mut s = session();
        s.feed(&cycle(true, 80));
        assert!(s.engine.find::<TemperatureAlert>().unwrap().is_triggered());

        s.begin(&job());
        assert!(!s.engine.find::<TemperatureAlert>().unwrap().is_triggered());
        // Ainda quente: dispara de novo na sessão nova
        assert_eq!(s.feed(&cycle(true, 80)).len(), 1);
    }
}
