//! Configuração unificada via TOML.
//!
//! Um único `bench.toml` cobre alertas, canais de notificação, scheduler,
//! monitor e os jobs agendados na partida. Todas as seções usam
//! `#[serde(default)]`, então arquivos parciais são válidos.

use crate::alerts::{
    AlertEngine, CapacityAlert, OvercurrentAlert, OvervoltageAlert, TemperatureAlert,
    TestCompleteAlert, VoltageAlert,
};
use crate::scheduler::{JobId, JobPayload, JobTable, SchedulerError};
use chrono::{DateTime, Local, TimeDelta};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Erros de configuração.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Erro de I/O em {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML inválido: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Falha ao serializar TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Job inválido ({profile}): {reason}")]
    InvalidJob { profile: PathBuf, reason: String },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

// ──────────────────────────────────────────────
// Alertas
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoltageLowConfig {
    pub enabled: bool,
    pub threshold_v: f64,
    pub hysteresis_v: f64,
}

impl Default for VoltageLowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_v: 3.0,
            hysteresis_v: VoltageAlert::DEFAULT_HYSTERESIS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureHighConfig {
    pub enabled: bool,
    pub threshold_c: i32,
    /// Usa a sonda externa
    pub use_external: bool,
}

impl Default for TemperatureHighConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_c: 70,
            use_external: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityTargetConfig {
    pub enabled: bool,
    pub target_mah: f64,
}

impl Default for CapacityTargetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_mah: 1000.0,
        }
    }
}

/// Quais condições o motor de alertas recebe na partida.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub voltage_low: VoltageLowConfig,
    pub temperature_high: TemperatureHighConfig,
    pub overcurrent_enabled: bool,
    pub overvoltage_enabled: bool,
    pub test_complete_enabled: bool,
    pub capacity_target: CapacityTargetConfig,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            voltage_low: VoltageLowConfig::default(),
            temperature_high: TemperatureHighConfig::default(),
            overcurrent_enabled: false,
            overvoltage_enabled: false,
            test_complete_enabled: true,
            capacity_target: CapacityTargetConfig::default(),
        }
    }
}

impl AlertConfig {
    /// Monta o motor sem dispatch. A ordem das condições é fixa.
    pub fn build_engine(&self) -> AlertEngine {
        let mut engine = AlertEngine::new();

        let v = &self.voltage_low;
        if v.enabled {
            engine.add(VoltageAlert::with_hysteresis(v.threshold_v, v.hysteresis_v));
        }
        let t = &self.temperature_high;
        if t.enabled {
            engine.add(if t.use_external {
                TemperatureAlert::external(t.threshold_c)
            } else {
                TemperatureAlert::new(t.threshold_c)
            });
        }
        if self.overcurrent_enabled {
            engine.add(OvercurrentAlert::new());
        }
        if self.overvoltage_enabled {
            engine.add(OvervoltageAlert::new());
        }
        if self.test_complete_enabled {
            engine.add(TestCompleteAlert::new());
        }
        if self.capacity_target.enabled {
            engine.add(CapacityAlert::new(self.capacity_target.target_mah));
        }

        engine
    }
}

// ──────────────────────────────────────────────
// Notificações, scheduler, monitor
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Título das notificações desktop
    pub app_title: String,
    pub log_enabled: bool,
    pub desktop_enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            app_title: "Load Test Bench".into(),
            log_enabled: true,
            desktop_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Intervalo entre verificações de jobs (s)
    pub poll_interval_secs: f64,
    /// Espera máxima no stop (s)
    pub stop_timeout_secs: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1.0,
            stop_timeout_secs: 2.0,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        secs_or(self.poll_interval_secs, Self::default().poll_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        secs_or(self.stop_timeout_secs, Self::default().stop_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Pausa entre rajadas de consultas (s)
    pub poll_interval_secs: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 0.5,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        secs_or(self.poll_interval_secs, Self::default().poll_interval_secs)
    }
}

/// Zero, negativos ou não finitos caem no padrão.
fn secs_or(secs: f64, fallback: f64) -> Duration {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => d,
        _ => Duration::from_secs_f64(fallback),
    }
}

// ──────────────────────────────────────────────
// Jobs
// ──────────────────────────────────────────────

/// Job agendado na partida. Exatamente um de `delay_secs` / `at`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub profile_path: PathBuf,
    pub battery_name: String,
    pub notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<f64>,
    /// Horário RFC 3339, ex: "2026-03-01T08:00:00-03:00"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_hours: Option<f64>,
}

impl JobConfig {
    pub fn payload(&self) -> JobPayload {
        JobPayload::new(self.profile_path.clone())
            .with_battery(self.battery_name.clone())
            .with_notes(self.notes.clone())
    }

    /// Problemas encontrados, vazio se o job é agendável.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match (&self.delay_secs, &self.at) {
            (Some(_), Some(_)) => problems.push("delay_secs e at são mutuamente exclusivos".into()),
            (None, None) => problems.push("informe delay_secs ou at".into()),
            (Some(d), None) if !d.is_finite() => problems.push(format!("delay_secs inválido: {d}")),
            (None, Some(at)) => {
                if let Err(e) = DateTime::parse_from_rfc3339(at) {
                    problems.push(format!("at inválido ({at}): {e}"));
                }
            }
            _ => {}
        }

        if let Some(hours) = self.repeat_hours {
            if !(hours.is_finite() && hours > 0.0) {
                problems.push(format!("repeat_hours deve ser positivo: {hours}"));
            }
        }

        problems
    }

    /// Agenda o job na tabela, relativo a agora.
    pub fn schedule(&self, table: &JobTable) -> Result<JobId, ConfigError> {
        if let Some(reason) = self.problems().into_iter().next() {
            return Err(self.invalid(reason));
        }

        let repeat = match self.repeat_hours {
            Some(hours) => Some(
                TimeDelta::try_seconds((hours * 3600.0).round() as i64)
                    .ok_or_else(|| self.invalid(format!("repeat_hours fora do limite: {hours}")))?,
            ),
            None => None,
        };

        let id = match (&self.delay_secs, &self.at) {
            (Some(delay), None) => {
                let delay = TimeDelta::try_milliseconds((delay * 1000.0).round() as i64)
                    .ok_or_else(|| self.invalid(format!("delay_secs fora do limite: {delay}")))?;
                match repeat {
                    None => table.schedule_delay(self.payload(), delay)?,
                    Some(every) => {
                        let at = Local::now()
                            .checked_add_signed(delay)
                            .ok_or(SchedulerError::TimeOutOfRange)?;
                        table.schedule_at(self.payload(), at, Some(every))?
                    }
                }
            }
            (None, Some(at)) => {
                let at = DateTime::parse_from_rfc3339(at)
                    .map_err(|e| self.invalid(e.to_string()))?
                    .with_timezone(&Local);
                table.schedule_at(self.payload(), at, repeat)?
            }
            _ => return Err(self.invalid("informe apenas um de delay_secs ou at")),
        };

        Ok(id)
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidJob {
            profile: self.profile_path.clone(),
            reason: reason.into(),
        }
    }
}

// ──────────────────────────────────────────────
// Raiz
// ──────────────────────────────────────────────

/// Configuração raiz da bancada.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub alerts: AlertConfig,
    pub notifications: NotificationConfig,
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub jobs: Vec<JobConfig>,
}

impl AppConfig {
    /// Carrega de um arquivo TOML; em caso de falha usa o padrão.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match Self::try_load(path) {
                Ok(config) => {
                    info!("Configuração carregada de {}", path.display());
                    return config;
                }
                Err(e) => warn!("Erro ao carregar {}: {}", path.display(), e),
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Salva em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do bench.toml (ao lado do executável).
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("bench.toml")
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let intervals = [
            ("scheduler.poll_interval_secs", self.scheduler.poll_interval_secs),
            ("monitor.poll_interval_secs", self.monitor.poll_interval_secs),
        ];
        for (name, secs) in intervals {
            if !(secs > 0.0 && secs <= 60.0) {
                errors.push(format!("{name} inválido: {secs} (0–60, exclusivo em 0)"));
            }
        }
        if !(self.scheduler.stop_timeout_secs >= 0.0) {
            errors.push(format!(
                "scheduler.stop_timeout_secs não pode ser negativo: {}",
                self.scheduler.stop_timeout_secs
            ));
        }
        if !(self.alerts.voltage_low.hysteresis_v >= 0.0) {
            errors.push(format!(
                "alerts.voltage_low.hysteresis_v não pode ser negativo: {}",
                self.alerts.voltage_low.hysteresis_v
            ));
        }

        for (i, job) in self.jobs.iter().enumerate() {
            for problem in job.problems() {
                errors.push(format!("jobs[{i}] ({}): {problem}", job.profile_path.display()));
            }
        }

        errors
    }

    /// Agenda todos os jobs; os inválidos são logados e pulados.
    pub fn schedule_jobs(&self, table: &JobTable) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter_map(|job| match job.schedule(table) {
                Ok(id) => {
                    info!("Job {id} agendado: {}", job.profile_path.display());
                    Some(id)
                }
                Err(e) => {
                    warn!("{e}");
                    None
                }
            })
            .collect()
    }
}
