//! Perfis de teste em JSON.
//!
//! O núcleo não executa perfis: o scheduler só carrega o caminho do arquivo
//! dentro do [`JobPayload`](crate::scheduler::JobPayload). Este módulo
//! existe para quem consome o callback ler e gravar o documento.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Erros de leitura/gravação de perfil.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Erro de I/O em {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON inválido: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tipo de perfil desconhecido: {0}")]
    UnknownType(String),
}

/// Um degrau de corrente do perfil escalonado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentStep {
    pub current_a: f64,
    pub duration_s: f64,
}

/// Documento de perfil, discriminado pelo campo `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TestProfile {
    /// Descarga com corrente constante até o corte.
    DischargeProfile {
        #[serde(default)]
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default = "default_current")]
        current_a: f64,
        #[serde(default = "default_cutoff")]
        voltage_cutoff: f64,
        #[serde(default)]
        max_duration_s: Option<f64>,
    },
    /// Descargas repetidas com descanso entre elas.
    CycleProfile {
        #[serde(default)]
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default = "default_current")]
        current_a: f64,
        #[serde(default = "default_cutoff")]
        voltage_cutoff: f64,
        #[serde(default = "default_cycles")]
        num_cycles: u32,
        #[serde(default = "default_cycle_rest")]
        rest_between_cycles_s: f64,
    },
    /// Corrente constante por tempo fixo.
    TimedProfile {
        #[serde(default)]
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default = "default_current")]
        current_a: f64,
        #[serde(default = "default_timed_duration")]
        duration_s: f64,
        #[serde(default)]
        voltage_cutoff: Option<f64>,
    },
    /// Sequência de degraus de corrente.
    SteppedProfile {
        #[serde(default)]
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        steps: Vec<CurrentStep>,
        #[serde(default)]
        voltage_cutoff: Option<f64>,
        #[serde(default = "default_step_rest")]
        rest_between_steps_s: f64,
    },
}

fn default_current() -> f64 {
    0.5
}

fn default_cutoff() -> f64 {
    3.0
}

fn default_cycles() -> u32 {
    1
}

fn default_cycle_rest() -> f64 {
    60.0
}

fn default_timed_duration() -> f64 {
    3600.0
}

fn default_step_rest() -> f64 {
    10.0
}

const KNOWN_TYPES: [&str; 4] = [
    "DischargeProfile",
    "CycleProfile",
    "TimedProfile",
    "SteppedProfile",
];

impl TestProfile {
    /// Perfil de descarga com todos os padrões.
    pub fn discharge(name: impl Into<String>, current_a: f64, voltage_cutoff: f64) -> Self {
        Self::DischargeProfile {
            name: name.into(),
            description: String::new(),
            current_a,
            voltage_cutoff,
            max_duration_s: None,
        }
    }

    /// Preset de resistência interna: degraus curtos com 5 s de descanso.
    pub fn stepped_ir_test(currents: &[f64], duration_per_step: f64) -> Self {
        Self::SteppedProfile {
            name: "IR Test".into(),
            description: "Teste de resistência interna".into(),
            steps: currents
                .iter()
                .map(|&current_a| CurrentStep {
                    current_a,
                    duration_s: duration_per_step,
                })
                .collect(),
            voltage_cutoff: None,
            rest_between_steps_s: 5.0,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::DischargeProfile { name, .. }
            | Self::CycleProfile { name, .. }
            | Self::TimedProfile { name, .. }
            | Self::SteppedProfile { name, .. } => name,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DischargeProfile { .. } => "DischargeProfile",
            Self::CycleProfile { .. } => "CycleProfile",
            Self::TimedProfile { .. } => "TimedProfile",
            Self::SteppedProfile { .. } => "SteppedProfile",
        }
    }

    /// Lê o documento; sem `"type"` o perfil é de descarga.
    pub fn from_json(text: &str) -> Result<Self, ProfileError> {
        let mut value: Value = serde_json::from_str(text)?;

        if let Value::Object(map) = &mut value {
            match map.get("type") {
                None => {
                    debug!("Perfil sem \"type\", assumindo DischargeProfile");
                    map.insert("type".into(), Value::from("DischargeProfile"));
                }
                Some(Value::String(t)) if !KNOWN_TYPES.contains(&t.as_str()) => {
                    return Err(ProfileError::UnknownType(t.clone()));
                }
                Some(Value::String(_)) => {}
                Some(other) => return Err(ProfileError::UnknownType(other.to_string())),
            }
        }

        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String, ProfileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let profile = Self::from_json(&text)?;
        info!("Perfil {} carregado de {}", profile.name(), path.display());
        Ok(profile)
    }

    pub fn save(&self, path: &Path) -> Result<(), ProfileError> {
        std::fs::write(path, self.to_json()?).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Perfil {} salvo em {}", self.name(), path.display());
        Ok(())
    }
}
