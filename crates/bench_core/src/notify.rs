//! Entrega de alertas fora do caminho de avaliação.
//!
//! Cada alerta é entregue em uma thread própria por canal, para que a
//! latência do sistema operacional (que pode passar de segundos) nunca
//! atrase a avaliação do próximo snapshot.

use crate::alerts::{AlertResult, AlertSeverity};
use crate::config::NotificationConfig;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Erros de entrega.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Falha na entrega: {0}")]
    Delivery(String),

    #[error("Falha ao criar thread de notificação: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Canal de entrega (desktop, log, push…).
pub trait NotifySink: Send + Sync {
    fn name(&self) -> &str;

    /// Entrega síncrona. Chamado sempre fora da thread de avaliação.
    fn deliver(&self, alert: &AlertResult) -> Result<(), NotifyError>;
}

/// Escreve o alerta no log com nível conforme a severidade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotifySink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, alert: &AlertResult) -> Result<(), NotifyError> {
        match alert.severity {
            AlertSeverity::Info => info!(target: "alerts", "{}", alert.message),
            AlertSeverity::Warning => warn!(target: "alerts", "{}", alert.message),
            AlertSeverity::Error => error!(target: "alerts", "{}", alert.message),
        }
        Ok(())
    }
}

/// Notificação desktop via notify-rust.
#[derive(Debug, Clone)]
pub struct DesktopSink {
    title: String,
}

impl DesktopSink {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

impl NotifySink for DesktopSink {
    fn name(&self) -> &str {
        "desktop"
    }

    fn deliver(&self, alert: &AlertResult) -> Result<(), NotifyError> {
        notify_rust::Notification::new()
            .summary(&self.title)
            .body(&alert.message)
            .show()
            .map(|_| ())
            .map_err(|e| NotifyError::Delivery(e.to_string()))
    }
}

/// Distribui alertas para todos os canais, sem bloquear o chamador.
#[derive(Clone, Default)]
pub struct Notifier {
    sinks: Vec<Arc<dyn NotifySink>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("Notifier").field("sinks", &names).finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monta os canais habilitados na configuração.
    pub fn from_config(config: &NotificationConfig) -> Self {
        let mut notifier = Self::new();
        if config.log_enabled {
            notifier.add_sink(LogSink);
        }
        if config.desktop_enabled {
            notifier.add_sink(DesktopSink::new(config.app_title.clone()));
        }
        notifier
    }

    pub fn add_sink(&mut self, sink: impl NotifySink + 'static) {
        self.sinks.push(Arc::new(sink));
    }

    pub fn with_sink(mut self, sink: impl NotifySink + 'static) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Dispara uma thread por canal e retorna imediatamente.
    ///
    /// Falhas de entrega ficam no log da própria thread; só uma falha ao
    /// criar a thread volta para o chamador.
    pub fn dispatch(&self, alert: &AlertResult) -> Result<(), NotifyError> {
        let mut spawn_error = None;

        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let alert = alert.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("notify-{}", sink.name()))
                .spawn(move || {
                    if let Err(e) = sink.deliver(&alert) {
                        warn!("Canal {} falhou: {e}", sink.name());
                    }
                });
            if let Err(e) = spawned {
                spawn_error.get_or_insert(NotifyError::Spawn(e));
            }
        }

        spawn_error.map_or(Ok(()), Err)
    }

    /// Adapta o notifier ao formato aceito por `AlertEngine::set_dispatch`.
    pub fn into_dispatch(self) -> impl Fn(&AlertResult) -> Result<(), NotifyError> + Send + Sync + 'static {
        move |alert: &AlertResult| self.dispatch(alert)
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
    use std::time::Duration;

    struct ChannelSink {
        tx: Sender<String>,
    }

    impl NotifySink for ChannelSink {
        fn name(&self) -> &str {
            "channel"
        }

        fn deliver(&self, alert: &AlertResult) -> Result<(), NotifyError> {
            self.tx
                .send(alert.message.clone())
                .map_err(|e| NotifyError::Delivery(e.to_string()))
        }
    }

    /// Bloqueia até receber liberação, simulando entrega lenta.
    struct GatedSink {
        gate: Receiver<()>,
        done: Sender<()>,
    }

    impl NotifySink for GatedSink {
        fn name(&self) -> &str {
            "gated"
        }

        fn deliver(&self, _alert: &AlertResult) -> Result<(), NotifyError> {
            let _ = self.gate.recv();
            let _ = self.done.send(());
            Ok(())
        }
    }

    struct FailingSink;

    impl NotifySink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn deliver(&self, _alert: &AlertResult) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("sem daemon de notificação".into()))
        }
    }

    fn alert(message: &str) -> AlertResult {
        AlertResult {
            triggered: true,
            message: message.into(),
            severity: AlertSeverity::Warning,
        }
    }

    #[test]
    fn dispatch_reaches_every_sink() {
        let (tx, rx) = unbounded();
        let notifier = Notifier::new()
            .with_sink(ChannelSink { tx: tx.clone() })
            .with_sink(FailingSink)
            .with_sink(ChannelSink { tx });

        notifier.dispatch(&alert("tensão baixa")).unwrap();

        for _ in 0..2 {
            let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(msg, "tensão baixa");
        }
    }

    #[test]
    fn slow_sink_does_not_block_dispatch() {
        let (gate_tx, gate_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let notifier = Notifier::new().with_sink(GatedSink {
            gate: gate_rx,
            done: done_tx,
        });

        // Retorna com a entrega ainda pendente
        notifier.dispatch(&alert("fim de teste")).unwrap();
        assert!(done_rx.try_recv().is_err());

        gate_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn from_config_selects_sinks() {
        let config = NotificationConfig {
            log_enabled: true,
            desktop_enabled: false,
            ..Default::default()
        };
        assert_eq!(Notifier::from_config(&config).sink_count(), 1);

        let none = NotificationConfig {
            log_enabled: false,
            desktop_enabled: false,
            ..Default::default()
        };
        assert_eq!(Notifier::from_config(&none).sink_count(), 0);
    }

    #[test]
    fn log_sink_never_fails() {
        assert!(LogSink.deliver(&alert("ok")).is_ok());
    }
}
