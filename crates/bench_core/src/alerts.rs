//! Sistema de alertas – condições com latch e avaliação por borda.
//!
//! Cada condição tem dois estados, armada e disparada. A transição
//! armada → disparada gera exatamente um [`AlertResult`]; o rearme é
//! silencioso. O [`AlertEngine`] avalia todas as condições, em ordem de
//! inserção, contra cada [`TelemetrySnapshot`].

use crate::notify::NotifyError;
use crate::types::TelemetrySnapshot;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, error, info, warn};

/// Severidade de um alerta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    #[default]
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
        })
    }
}

/// Um alerta disparado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertResult {
    pub triggered: bool,
    pub message: String,
    pub severity: AlertSeverity,
}

impl AlertResult {
    fn fired(severity: AlertSeverity, message: String) -> Self {
        Self {
            triggered: true,
            message,
            severity,
        }
    }
}

/// Interface comum de todas as condições.
pub trait Condition {
    /// Avalia o snapshot. Retorna um resultado só na borda de disparo.
    fn check(&mut self, status: &TelemetrySnapshot) -> Option<AlertResult>;

    /// Volta ao estado armado e limpa latches auxiliares.
    fn reset(&mut self);

    fn is_triggered(&self) -> bool;
}

// ──────────────────────────────────────────────
// Tensão baixa
// ──────────────────────────────────────────────

/// Dispara quando a tensão cai até o limite; rearma acima de `threshold + hysteresis`.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageAlert {
    /// Limite (V)
    pub threshold: f64,
    /// Banda de rearme (V)
    pub hysteresis: f64,
    triggered: bool,
}

impl VoltageAlert {
    pub const DEFAULT_HYSTERESIS: f64 = 0.1;

    pub fn new(threshold: f64) -> Self {
        Self::with_hysteresis(threshold, Self::DEFAULT_HYSTERESIS)
    }

    pub fn with_hysteresis(threshold: f64, hysteresis: f64) -> Self {
        Self {
            threshold,
            hysteresis,
            triggered: false,
        }
    }
}

impl Condition for VoltageAlert {
    fn check(&mut self, status: &TelemetrySnapshot) -> Option<AlertResult> {
        if !self.triggered && status.voltage <= self.threshold {
            self.triggered = true;
            return Some(AlertResult::fired(
                AlertSeverity::Warning,
                format!(
                    "Tensão caiu para {:.2}V (abaixo de {}V)",
                    status.voltage, self.threshold
                ),
            ));
        }

        if self.triggered && status.voltage > self.threshold + self.hysteresis {
            self.triggered = false;
        }
        None
    }

    fn reset(&mut self) {
        self.triggered = false;
    }

    fn is_triggered(&self) -> bool {
        self.triggered
    }
}

// ──────────────────────────────────────────────
// Temperatura alta
// ──────────────────────────────────────────────

/// Dispara quando a temperatura atinge o limite; rearma 5 °C abaixo dele.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureAlert {
    /// Limite (°C)
    pub threshold: i32,
    /// Usa a sonda externa em vez do sensor interno
    pub use_external: bool,
    triggered: bool,
}

impl TemperatureAlert {
    /// Banda fixa de rearme (°C).
    pub const REARM_BAND: i32 = 5;

    pub fn new(threshold: i32) -> Self {
        Self {
            threshold,
            use_external: false,
            triggered: false,
        }
    }

    pub fn external(threshold: i32) -> Self {
        Self {
            use_external: true,
            ..Self::new(threshold)
        }
    }
}

impl Default for TemperatureAlert {
    fn default() -> Self {
        Self::new(60)
    }
}

impl Condition for TemperatureAlert {
    fn check(&mut self, status: &TelemetrySnapshot) -> Option<AlertResult> {
        let temp = if self.use_external {
            status.ext_temperature_c
        } else {
            status.temperature_c
        };

        if !self.triggered && temp >= self.threshold {
            self.triggered = true;
            let source = if self.use_external { "externa" } else { "interna" };
            return Some(AlertResult::fired(
                AlertSeverity::Error,
                format!(
                    "Temperatura {source} atingiu {temp}°C (limite: {}°C)",
                    self.threshold
                ),
            ));
        }

        if self.triggered && temp < self.threshold - Self::REARM_BAND {
            self.triggered = false;
        }
        None
    }

    fn reset(&mut self) {
        self.triggered = false;
    }

    fn is_triggered(&self) -> bool {
        self.triggered
    }
}

// ──────────────────────────────────────────────
// Proteções de hardware
// ──────────────────────────────────────────────

/// Latch compartilhado pelas proteções: segue a flag, dispara na subida.
#[derive(Debug, Clone, Default, PartialEq)]
struct ProtectionLatch {
    triggered: bool,
}

impl ProtectionLatch {
    fn check(&mut self, flag: bool, message: &str) -> Option<AlertResult> {
        if !self.triggered && flag {
            self.triggered = true;
            return Some(AlertResult::fired(AlertSeverity::Error, message.to_string()));
        }
        if self.triggered && !flag {
            self.triggered = false;
        }
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OvercurrentAlert {
    latch: ProtectionLatch,
}

impl OvercurrentAlert {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Condition for OvercurrentAlert {
    fn check(&mut self, status: &TelemetrySnapshot) -> Option<AlertResult> {
        self.latch
            .check(status.overcurrent, "Proteção de sobrecorrente acionada!")
    }

    fn reset(&mut self) {
        self.latch.triggered = false;
    }

    fn is_triggered(&self) -> bool {
        self.latch.triggered
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OvervoltageAlert {
    latch: ProtectionLatch,
}

impl OvervoltageAlert {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Condition for OvervoltageAlert {
    fn check(&mut self, status: &TelemetrySnapshot) -> Option<AlertResult> {
        self.latch
            .check(status.overvoltage, "Proteção de sobretensão acionada!")
    }

    fn reset(&mut self) {
        self.latch.triggered = false;
    }

    fn is_triggered(&self) -> bool {
        self.latch.triggered
    }
}

// ──────────────────────────────────────────────
// Fim de teste
// ──────────────────────────────────────────────

/// Dispara quando a carga desliga depois de ter estado ligada.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestCompleteAlert {
    was_on: bool,
    triggered: bool,
}

impl TestCompleteAlert {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Condition for TestCompleteAlert {
    fn check(&mut self, status: &TelemetrySnapshot) -> Option<AlertResult> {
        if status.load_on {
            self.was_on = true;
            self.triggered = false;
            return None;
        }

        if self.was_on && !self.triggered {
            self.triggered = true;
            return Some(AlertResult::fired(
                AlertSeverity::Info,
                format!(
                    "Teste concluído: {:.0}mAh / {:.2}Wh",
                    status.capacity_mah, status.energy_wh
                ),
            ));
        }
        None
    }

    fn reset(&mut self) {
        self.was_on = false;
        self.triggered = false;
    }

    fn is_triggered(&self) -> bool {
        self.triggered
    }
}

// ──────────────────────────────────────────────
// Capacidade alvo
// ──────────────────────────────────────────────

/// Dispara uma vez ao atingir a capacidade alvo. Só rearma via `reset()`.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityAlert {
    /// Alvo (mAh)
    pub target_mah: f64,
    triggered: bool,
}

impl CapacityAlert {
    pub fn new(target_mah: f64) -> Self {
        Self {
            target_mah,
            triggered: false,
        }
    }
}

impl Condition for CapacityAlert {
    fn check(&mut self, status: &TelemetrySnapshot) -> Option<AlertResult> {
        if !self.triggered && status.capacity_mah >= self.target_mah {
            self.triggered = true;
            return Some(AlertResult::fired(
                AlertSeverity::Info,
                format!(
                    "Capacidade atingiu {:.0}mAh (alvo: {:.0}mAh)",
                    status.capacity_mah, self.target_mah
                ),
            ));
        }
        None
    }

    fn reset(&mut self) {
        self.triggered = false;
    }

    fn is_triggered(&self) -> bool {
        self.triggered
    }
}

// ──────────────────────────────────────────────
// Conjunto fechado de condições
// ──────────────────────────────────────────────

/// Tipo de condição, usado para busca no motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    VoltageLow,
    TemperatureHigh,
    Overcurrent,
    Overvoltage,
    TestComplete,
    CapacityTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertCondition {
    VoltageLow(VoltageAlert),
    TemperatureHigh(TemperatureAlert),
    Overcurrent(OvercurrentAlert),
    Overvoltage(OvervoltageAlert),
    TestComplete(TestCompleteAlert),
    CapacityTarget(CapacityAlert),
}

impl AlertCondition {
    pub fn kind(&self) -> AlertKind {
        match self {
            Self::VoltageLow(_) => AlertKind::VoltageLow,
            Self::TemperatureHigh(_) => AlertKind::TemperatureHigh,
            Self::Overcurrent(_) => AlertKind::Overcurrent,
            Self::Overvoltage(_) => AlertKind::Overvoltage,
            Self::TestComplete(_) => AlertKind::TestComplete,
            Self::CapacityTarget(_) => AlertKind::CapacityTarget,
        }
    }

    fn inner(&self) -> &dyn Condition {
        match self {
            Self::VoltageLow(c) => c,
            Self::TemperatureHigh(c) => c,
            Self::Overcurrent(c) => c,
            Self::Overvoltage(c) => c,
            Self::TestComplete(c) => c,
            Self::CapacityTarget(c) => c,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Condition {
        match self {
            Self::VoltageLow(c) => c,
            Self::TemperatureHigh(c) => c,
            Self::Overcurrent(c) => c,
            Self::Overvoltage(c) => c,
            Self::TestComplete(c) => c,
            Self::CapacityTarget(c) => c,
        }
    }
}

impl Condition for AlertCondition {
    fn check(&mut self, status: &TelemetrySnapshot) -> Option<AlertResult> {
        self.inner_mut().check(status)
    }

    fn reset(&mut self) {
        self.inner_mut().reset();
    }

    fn is_triggered(&self) -> bool {
        self.inner().is_triggered()
    }
}

/// Liga cada tipo concreto à sua variante, para a busca tipada do motor.
pub trait ConditionVariant: Condition + Into<AlertCondition> {
    const KIND: AlertKind;

    fn from_ref(condition: &AlertCondition) -> Option<&Self>;

    fn from_mut(condition: &mut AlertCondition) -> Option<&mut Self>;
}

macro_rules! condition_variant {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for AlertCondition {
            fn from(condition: $ty) -> Self {
                AlertCondition::$variant(condition)
            }
        }

        impl ConditionVariant for $ty {
            const KIND: AlertKind = AlertKind::$variant;

            fn from_ref(condition: &AlertCondition) -> Option<&Self> {
                match condition {
                    AlertCondition::$variant(c) => Some(c),
                    _ => None,
                }
            }

            fn from_mut(condition: &mut AlertCondition) -> Option<&mut Self> {
                match condition {
                    AlertCondition::$variant(c) => Some(c),
                    _ => None,
                }
            }
        }
    };
}

condition_variant!(VoltageAlert, VoltageLow);
condition_variant!(TemperatureAlert, TemperatureHigh);
condition_variant!(OvercurrentAlert, Overcurrent);
condition_variant!(OvervoltageAlert, Overvoltage);
condition_variant!(TestCompleteAlert, TestComplete);
condition_variant!(CapacityAlert, CapacityTarget);

// ──────────────────────────────────────────────
// Motor
// ──────────────────────────────────────────────

/// Identificador estável de uma condição dentro do motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionId(u32);

/// Colaborador que entrega alertas (desktop, log, push…).
pub type DispatchFn = Box<dyn Fn(&AlertResult) -> Result<(), NotifyError> + Send + Sync>;

/// Alertas aguardando entrega antes de começar a descartar.
const DISPATCH_QUEUE: usize = 64;

/// Conjunto ordenado de condições avaliadas a cada snapshot.
#[derive(Default)]
pub struct AlertEngine {
    conditions: Vec<(ConditionId, AlertCondition)>,
    next_id: u32,
    /// Fila da thread `alert-dispatch`; fechada quando o motor cai.
    dispatch: Option<Sender<AlertResult>>,
}

impl std::fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEngine")
            .field("conditions", &self.conditions)
            .field("dispatch", &self.dispatch.is_some())
            .finish()
    }
}

impl AlertEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define o colaborador de entrega.
    ///
    /// O colaborador roda na thread `alert-dispatch`, nunca dentro de
    /// [`check`](Self::check). Erros e panics dele são engolidos. Trocar o
    /// colaborador encerra a thread anterior depois que a fila dela esvazia.
    pub fn set_dispatch<F>(&mut self, dispatch: F)
    where
        F: Fn(&AlertResult) -> Result<(), NotifyError> + Send + Sync + 'static,
    {
        let dispatch: DispatchFn = Box::new(dispatch);
        let (tx, rx) = bounded::<AlertResult>(DISPATCH_QUEUE);

        let spawned = std::thread::Builder::new()
            .name("alert-dispatch".into())
            .spawn(move || dispatch_loop(&rx, &dispatch));
        match spawned {
            Ok(_) => self.dispatch = Some(tx),
            Err(e) => {
                error!("Falha ao criar thread de entrega de alertas: {e}");
                self.dispatch = None;
            }
        }
    }

    pub fn add(&mut self, condition: impl Into<AlertCondition>) -> ConditionId {
        let id = ConditionId(self.next_id);
        self.next_id += 1;
        self.conditions.push((id, condition.into()));
        id
    }

    pub fn remove(&mut self, id: ConditionId) -> Option<AlertCondition> {
        let pos = self.conditions.iter().position(|(cid, _)| *cid == id)?;
        Some(self.conditions.remove(pos).1)
    }

    pub fn clear(&mut self) {
        self.conditions.clear();
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Rearma todas as condições (início de uma nova sessão de teste).
    pub fn reset_all(&mut self) {
        for (_, condition) in &mut self.conditions {
            condition.reset();
        }
    }

    /// Primeira condição do tipo dado.
    pub fn get(&self, kind: AlertKind) -> Option<&AlertCondition> {
        self.conditions
            .iter()
            .map(|(_, c)| c)
            .find(|c| c.kind() == kind)
    }

    pub fn get_mut(&mut self, kind: AlertKind) -> Option<&mut AlertCondition> {
        self.conditions
            .iter_mut()
            .map(|(_, c)| c)
            .find(|c| c.kind() == kind)
    }

    /// Busca tipada: `engine.find::<VoltageAlert>()`.
    pub fn find<T: ConditionVariant>(&self) -> Option<&T> {
        self.get(T::KIND).and_then(T::from_ref)
    }

    pub fn find_mut<T: ConditionVariant>(&mut self) -> Option<&mut T> {
        self.get_mut(T::KIND).and_then(T::from_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConditionId, &AlertCondition)> {
        self.conditions.iter().map(|(id, c)| (*id, c))
    }

    /// Avalia todas as condições e entrega cada alerta disparado.
    pub fn check(&mut self, status: &TelemetrySnapshot) -> Vec<AlertResult> {
        let mut alerts = Vec::new();

        for (_, condition) in &mut self.conditions {
            let Some(result) = condition.check(status) else {
                continue;
            };
            if !result.triggered {
                continue;
            }
            info!("Alerta [{}]: {}", result.severity, result.message);
            enqueue(self.dispatch.as_ref(), &result);
            alerts.push(result);
        }

        alerts
    }
}

/// Só enfileira: a avaliação nunca espera pelo colaborador.
fn enqueue(dispatch: Option<&Sender<AlertResult>>, result: &AlertResult) {
    let Some(tx) = dispatch else {
        return;
    };
    match tx.try_send(result.clone()) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("Fila de entrega cheia, alerta descartado"),
        Err(TrySendError::Disconnected(_)) => warn!("Thread de entrega encerrada, alerta descartado"),
    }
}

/// Entrega best-effort, em ordem, até a fila fechar.
fn dispatch_loop(rx: &Receiver<AlertResult>, dispatch: &DispatchFn) {
    for result in rx {
        match catch_unwind(AssertUnwindSafe(|| dispatch(&result))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Falha ao entregar alerta: {e}"),
            Err(_) => warn!("Entrega de alerta entrou em pânico"),
        }
    }
    debug!("Thread de entrega de alertas encerrada");
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
