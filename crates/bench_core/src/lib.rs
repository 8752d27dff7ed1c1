//! # Bench Core
//!
//! Núcleo da bancada de teste com a carga eletrônica DL24P (protocolo PX100):
//! codec de frames, montagem de snapshots, motor de alertas, entrega de
//! notificações e agendamento de testes.
//!
//! ## Módulos
//! - [`protocol`] – Frames de comando (6 bytes) e resposta (8 bytes)
//! - [`types`] – Snapshot de telemetria e montagem por ciclo de polling
//! - [`alerts`] – Condições com estado e o motor que as avalia
//! - [`notify`] – Canais de entrega (log, desktop) fora da thread de avaliação
//! - [`scheduler`] – Jobs agendados em thread de background
//! - [`profile`] – Documentos JSON de perfil de teste
//! - [`config`] – Configuração unificada via TOML

pub mod protocol;
pub mod types;
pub mod alerts;
pub mod notify;
pub mod scheduler;
pub mod profile;
pub mod config;

// Re-exports convenientes
pub use alerts::{AlertEngine, AlertResult, AlertSeverity, Condition};
pub use config::{AppConfig, ConfigError};
pub use notify::{Notifier, NotifyError, NotifySink};
pub use protocol::{Command, FrameBuffer, ResponseRecord, find_response, parse_response};
pub use scheduler::{JobId, JobPayload, ScheduledJob, Scheduler, SchedulerError};
pub use types::{SnapshotAssembler, TelemetrySnapshot};
