//! # Bench Monitor
//!
//! Lê o stream de bytes da carga DL24P, monta snapshots, avalia alertas e
//! dispara os testes agendados.
//!
//! ## Uso
//! ```bash
//! socat /dev/ttyUSB0,b9600,raw - | bench_monitor            # Só recepção
//! socat /dev/ttyUSB0,b9600,raw EXEC:"bench_monitor bench.toml --emit-queries"
//! ```

mod reader;
mod session;

use bench_core::config::AppConfig;
use bench_core::notify::Notifier;
use bench_core::protocol::cmd_query;
use bench_core::scheduler::{ScheduledJob, Scheduler};
use bench_core::types::POLL_CYCLE;
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded, select};
use session::Session;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

fn main() {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── Argumentos ──
    let emit_queries = std::env::args().any(|a| a == "--emit-queries");
    let config_path = std::env::args()
        .skip(1)
        .find(|a| !a.starts_with("--"))
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);

    // ── Carregar config ──
    let config = AppConfig::load(&config_path);

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }
    for problem in config.validate() {
        warn!("Config: {problem}");
    }

    // ── Alertas ──
    let mut engine = config.alerts.build_engine();
    let notifier = Notifier::from_config(&config.notifications);
    info!("Alertas: {} condições, {} canais", engine.len(), notifier.sink_count());
    engine.set_dispatch(notifier.into_dispatch());
    let mut session = Session::new(engine);

    // ── Scheduler ──
    let (job_tx, job_rx) = bounded::<ScheduledJob>(16);
    let scheduler = Scheduler::from_config(&config.scheduler);
    scheduler.set_callback(move |job| {
        info!("Iniciando teste agendado {}", job.id);
        job_tx.try_send(job.clone())?;
        Ok(())
    });
    config.schedule_jobs(&scheduler.table());
    if let Err(e) = scheduler.start() {
        error!("{e}. Continuando sem agendamentos.");
    }

    // ── Transporte ──
    let data_rx = match reader::spawn_reader_thread(std::io::stdin()) {
        Ok(rx) => rx,
        Err(e) => {
            error!("Falha ao criar thread de leitura: {e}");
            scheduler.stop();
            std::process::exit(1);
        }
    };

    // Mantido vivo até o fim: o drop encerra o writer
    let (_query_stop, query_stop_rx) = bounded::<()>(1);
    if emit_queries {
        spawn_query_writer(config.monitor.poll_interval(), query_stop_rx);
    }

    info!("Monitor ativo ({})", config_path.display());

    // ── Loop principal ──
    loop {
        select! {
            recv(data_rx) -> chunk => match chunk {
                Ok(chunk) => {
                    session.feed(&chunk);
                }
                Err(_) => break,
            },
            // O sender vive no callback do scheduler, que só cai no fim do main
            recv(job_rx) -> job => if let Ok(job) = job {
                session.begin(&job);
            },
        }
    }

    // ── Encerramento ──
    if !scheduler.stop() {
        warn!("Scheduler não encerrou a tempo");
    }
    match session.last_snapshot() {
        Some(last) => info!("Último estado: {last}"),
        None => info!("Nenhum snapshot completo recebido"),
    }
    info!(
        "Encerrado: {} snapshots, {} alertas",
        session.snapshot_count(),
        session.alert_count()
    );
}

/// Escreve as consultas do ciclo de polling no stdout até o stop fechar.
fn spawn_query_writer(interval: Duration, stop_rx: Receiver<()>) {
    let spawned = std::thread::Builder::new()
        .name("query-writer".into())
        .spawn(move || {
            let frames: Vec<u8> = POLL_CYCLE.iter().flat_map(|&cmd| cmd_query(cmd)).collect();
            let mut stdout = std::io::stdout().lock();
            loop {
                if let Err(e) = stdout.write_all(&frames).and_then(|()| stdout.flush()) {
                    warn!("Falha ao escrever consultas: {e}");
                    break;
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }
        });
    if let Err(e) = spawned {
        error!("Falha ao criar thread de consultas: {e}");
    }
}
