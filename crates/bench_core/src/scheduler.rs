//! Agendamento de testes em background.
//!
//! Uma única thread (`scheduler`) acorda a cada `poll_interval`, coleta os
//! jobs vencidos sob o lock da tabela, solta o lock e só então chama o
//! callback. Assim um callback pode chamar `schedule()`/`cancel()` sem
//! deadlock.
//!
//! Repetição: o próximo vencimento é `agora + intervalo`, não
//! `vencimento_anterior + intervalo`.

use crate::config::SchedulerConfig;
use chrono::{DateTime, Local, TimeDelta};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Erros do scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Já existe um job agendado com id {0}")]
    DuplicateId(JobId),

    #[error("Intervalo de repetição deve ser positivo (recebido {0})")]
    InvalidInterval(TimeDelta),

    #[error("Horário fora do intervalo suportado")]
    TimeOutOfRange,

    #[error("Falha ao criar thread do scheduler: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Identificador de job. Nunca reutilizado enquanto o job estiver na tabela.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Gera um id único com prefixo legível (`delay-…`, `at-…`).
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Referência opaca entregue ao callback; o perfil não é lido aqui.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub profile_path: PathBuf,
    pub battery_name: String,
    pub notes: String,
}

impl JobPayload {
    pub fn new(profile_path: impl Into<PathBuf>) -> Self {
        Self {
            profile_path: profile_path.into(),
            ..Default::default()
        }
    }

    pub fn with_battery(mut self, battery_name: impl Into<String>) -> Self {
        self.battery_name = battery_name.into();
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub id: JobId,
    pub due_time: DateTime<Local>,
    pub payload: JobPayload,
    pub repeat_interval: Option<TimeDelta>,
}

impl ScheduledJob {
    pub fn once(id: JobId, due_time: DateTime<Local>, payload: JobPayload) -> Self {
        Self {
            id,
            due_time,
            payload,
            repeat_interval: None,
        }
    }
}

/// Erro devolvido por um callback de job.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Chamado quando um job vence (ex: "iniciar este teste").
pub type JobCallback = Arc<dyn Fn(&ScheduledJob) -> Result<(), JobError> + Send + Sync>;

// ──────────────────────────────────────────────
// Tabela de jobs
// ──────────────────────────────────────────────

/// Tabela compartilhada `id → job`. Clonar compartilha a mesma tabela.
///
/// O lock cobre apenas leitura/escrita da tabela, nunca a execução de callbacks.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    jobs: Arc<Mutex<HashMap<JobId, ScheduledJob>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, job: ScheduledJob) -> Result<JobId, SchedulerError> {
        if let Some(every) = job.repeat_interval {
            if every <= TimeDelta::zero() {
                return Err(SchedulerError::InvalidInterval(every));
            }
        }

        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(SchedulerError::DuplicateId(job.id));
        }
        let id = job.id.clone();
        debug!("Job {id} agendado para {}", job.due_time);
        jobs.insert(id.clone(), job);
        Ok(id)
    }

    /// Agenda para daqui a `delay`.
    pub fn schedule_delay(&self, payload: JobPayload, delay: TimeDelta) -> Result<JobId, SchedulerError> {
        let due_time = Local::now()
            .checked_add_signed(delay)
            .ok_or(SchedulerError::TimeOutOfRange)?;
        self.schedule(ScheduledJob::once(JobId::generate("delay"), due_time, payload))
    }

    /// Agenda para um horário absoluto, opcionalmente repetindo.
    pub fn schedule_at(
        &self,
        payload: JobPayload,
        at: DateTime<Local>,
        repeat_interval: Option<TimeDelta>,
    ) -> Result<JobId, SchedulerError> {
        self.schedule(ScheduledJob {
            id: JobId::generate("at"),
            due_time: at,
            payload,
            repeat_interval,
        })
    }

    /// Remove o job. Retorna `true` se ele existia.
    pub fn cancel(&self, id: &JobId) -> bool {
        self.jobs.lock().remove(id).is_some()
    }

    pub fn get(&self, id: &JobId) -> Option<ScheduledJob> {
        self.jobs.lock().get(id).cloned()
    }

    /// Cópia dos jobs, ordenada por vencimento.
    pub fn jobs(&self) -> Vec<ScheduledJob> {
        let mut list: Vec<_> = self.jobs.lock().values().cloned().collect();
        list.sort_by(|a, b| a.due_time.cmp(&b.due_time).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Retira os jobs vencidos: repetidos avançam para `now + intervalo`,
    /// os demais saem da tabela. Retorna cópias no estado em que venceram.
    fn take_due(&self, now: DateTime<Local>) -> Vec<ScheduledJob> {
        let mut jobs = self.jobs.lock();
        let mut due = Vec::new();

        for job in jobs.values_mut().filter(|j| j.due_time <= now) {
            due.push(job.clone());
            if let Some(every) = job.repeat_interval {
                match now.checked_add_signed(every) {
                    Some(next) => job.due_time = next,
                    None => {
                        warn!("Job {} não pode mais repetir, removendo", job.id);
                        job.repeat_interval = None;
                    }
                }
            }
        }
        jobs.retain(|_, j| j.repeat_interval.is_some() || j.due_time > now);

        due.sort_by(|a, b| a.due_time.cmp(&b.due_time).then_with(|| a.id.cmp(&b.id)));
        due
    }
}

// ──────────────────────────────────────────────
// Scheduler
// ──────────────────────────────────────────────

struct LoopHandle {
    stop_tx: Sender<()>,
    exited_rx: Receiver<()>,
    thread: JoinHandle<()>,
}

/// Dispara jobs vencidos em uma thread de background.
pub struct Scheduler {
    table: JobTable,
    callback: Arc<Mutex<Option<JobCallback>>>,
    poll_interval: Duration,
    stop_timeout: Duration,
    runner: Mutex<Option<LoopHandle>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.table.len())
            .field("poll_interval", &self.poll_interval)
            .field("stop_timeout", &self.stop_timeout)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl Scheduler {
    pub fn new(poll_interval: Duration, stop_timeout: Duration) -> Self {
        Self {
            table: JobTable::new(),
            callback: Arc::new(Mutex::new(None)),
            poll_interval,
            stop_timeout,
            runner: Mutex::new(None),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.poll_interval(), config.stop_timeout())
    }

    /// Handle da tabela, para uso dentro de callbacks.
    pub fn table(&self) -> JobTable {
        self.table.clone()
    }

    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&ScheduledJob) -> Result<(), JobError> + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(callback));
    }

    pub fn schedule(&self, job: ScheduledJob) -> Result<JobId, SchedulerError> {
        self.table.schedule(job)
    }

    pub fn schedule_delay(&self, payload: JobPayload, delay: TimeDelta) -> Result<JobId, SchedulerError> {
        self.table.schedule_delay(payload, delay)
    }

    pub fn schedule_at(
        &self,
        payload: JobPayload,
        at: DateTime<Local>,
        repeat_interval: Option<TimeDelta>,
    ) -> Result<JobId, SchedulerError> {
        self.table.schedule_at(payload, at, repeat_interval)
    }

    pub fn cancel(&self, id: &JobId) -> bool {
        self.table.cancel(id)
    }

    pub fn jobs(&self) -> Vec<ScheduledJob> {
        self.table.jobs()
    }

    pub fn is_running(&self) -> bool {
        self.runner
            .lock()
            .as_ref()
            .is_some_and(|h| !h.thread.is_finished())
    }

    /// Um tick do loop com `now` explícito. Retorna quantos jobs venceram.
    pub fn run_due(&self, now: DateTime<Local>) -> usize {
        fire_due(&self.table, &self.callback, now)
    }

    /// Inicia a thread do loop. Não faz nada se ela já estiver rodando.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut runner = self.runner.lock();
        if runner.as_ref().is_some_and(|h| !h.thread.is_finished()) {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (exited_tx, exited_rx) = bounded::<()>(1);
        let table = self.table.clone();
        let callback = Arc::clone(&self.callback);
        let poll_interval = self.poll_interval;

        let thread = std::thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || {
                // Dropado ao sair (inclusive em pânico): sinaliza o fim ao stop()
                let _exited = exited_tx;
                run_loop(&table, &callback, poll_interval, &stop_rx);
            })?;

        info!("Scheduler iniciado (poll {:?})", poll_interval);
        *runner = Some(LoopHandle {
            stop_tx,
            exited_rx,
            thread,
        });
        Ok(())
    }

    /// Sinaliza o loop e espera até `stop_timeout`.
    ///
    /// Retorna `false` se o prazo estourou; nesse caso a thread é abandonada
    /// e termina sozinha quando o callback em curso retornar.
    pub fn stop(&self) -> bool {
        let Some(handle) = self.runner.lock().take() else {
            return true;
        };

        let _ = handle.stop_tx.send(());
        match handle.exited_rx.recv_timeout(self.stop_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Scheduler não encerrou em {:?}, thread abandonada",
                    self.stop_timeout
                );
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.thread.join().is_err() {
                    warn!("Thread do scheduler terminou em pânico");
                }
                info!("Scheduler parado");
                true
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.runner.get_mut().take() {
            // Sem join: a thread sai no próximo tick
            let _ = handle.stop_tx.send(());
        }
    }
}

fn run_loop(
    table: &JobTable,
    callback: &Mutex<Option<JobCallback>>,
    poll_interval: Duration,
    stop_rx: &Receiver<()>,
) {
    loop {
        fire_due(table, callback, Local::now());

        match stop_rx.recv_timeout(poll_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Loop do scheduler encerrado");
}

fn fire_due(table: &JobTable, callback: &Mutex<Option<JobCallback>>, now: DateTime<Local>) -> usize {
    let due = table.take_due(now);
    if due.is_empty() {
        return 0;
    }

    // Clona o Arc e solta o lock antes de chamar
    let callback = callback.lock().clone();
    for job in &due {
        info!(
            "Job {} venceu: {} ({})",
            job.id,
            job.payload.profile_path.display(),
            job.payload.battery_name
        );
        let Some(callback) = callback.as_ref() else {
            debug!("Nenhum callback registrado para o job {}", job.id);
            continue;
        };
        match catch_unwind(AssertUnwindSafe(|| callback(job))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Callback do job {} falhou: {e}", job.id),
            Err(_) => warn!("Callback do job {} entrou em pânico", job.id),
        }
    }
    due.len()
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(Duration::from_millis(10), Duration::from_millis(500))
    }

    fn recorder(s: &Scheduler) -> Arc<Mutex<Vec<JobId>>> {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        s.set_callback(move |job| {
            sink.lock().push(job.id.clone());
            Ok(())
        });
        fired
    }

    #[test]
    fn one_shot_in_past_fires_and_is_removed() {
        let s = scheduler();
        let fired = recorder(&s);
        let now = Local::now();
        let id = s
            .schedule(ScheduledJob::once(JobId::new("past"), now - TimeDelta::seconds(5), JobPayload::new("p.json")))
            .unwrap();

        assert_eq!(s.run_due(now), 1);
        assert_eq!(*fired.lock(), vec![id.clone()]);
        assert!(s.table().get(&id).is_none());
        assert!(s.jobs().is_empty());
    }

    #[test]
    fn repeating_job_advances_from_now() {
        let s = scheduler();
        let now = Local::now();
        let interval = TimeDelta::hours(2);
        let id = s
            .schedule_at(JobPayload::new("cycle.json"), now - TimeDelta::minutes(30), Some(interval))
            .unwrap();

        assert_eq!(s.run_due(now), 1);
        let job = s.table().get(&id).expect("job repetido continua na tabela");
        assert_eq!(job.due_time, now + interval);
    }

    #[test]
    fn future_job_is_untouched() {
        let s = scheduler();
        let fired = recorder(&s);
        let now = Local::now();
        s.schedule_at(JobPayload::new("later.json"), now + TimeDelta::minutes(1), None)
            .unwrap();

        assert_eq!(s.run_due(now), 0);
        assert!(fired.lock().is_empty());
        assert_eq!(s.jobs().len(), 1);
    }

    #[test]
    fn cancel_reports_presence() {
        let s = scheduler();
        let id = s
            .schedule_delay(JobPayload::new("p.json"), TimeDelta::seconds(60))
            .unwrap();
        assert!(id.as_str().starts_with("delay-"));
        assert!(s.cancel(&id));
        assert!(!s.cancel(&id));
    }

    #[test]
    fn generated_ids_are_unique() {
        let s = scheduler();
        let a = s.schedule_delay(JobPayload::new("a"), TimeDelta::zero()).unwrap();
        let b = s.schedule_delay(JobPayload::new("b"), TimeDelta::zero()).unwrap();
        assert_ne!(a, b);
        assert_eq!(s.jobs().len(), 2);
    }

    #[test]
    fn duplicate_live_id_is_rejected() {
        let s = scheduler();
        let now = Local::now();
        let job = ScheduledJob::once(JobId::new("nightly"), now, JobPayload::new("a"));
        s.schedule(job.clone()).unwrap();
        assert!(matches!(s.schedule(job.clone()), Err(SchedulerError::DuplicateId(_))));

        // Depois de disparar o id fica livre de novo
        s.run_due(now);
        assert!(s.schedule(job).is_ok());
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let s = scheduler();
        let result = s.schedule_at(JobPayload::new("a"), Local::now(), Some(TimeDelta::zero()));
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));
    }

    #[test]
    fn failing_callbacks_do_not_block_other_jobs() {
        let s = scheduler();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        s.set_callback(move |job| {
            sink.lock().push(job.id.clone());
            match job.id.as_str() {
                "a-panics" => panic!("callback quebrado"),
                "b-errors" => Err("perfil ausente".into()),
                _ => Ok(()),
            }
        });

        let now = Local::now();
        for (i, name) in ["a-panics", "b-errors", "c-ok"].into_iter().enumerate() {
            let due = now - TimeDelta::seconds(10 - i as i64);
            s.schedule(ScheduledJob::once(JobId::new(name), due, JobPayload::new(name)))
                .unwrap();
        }

        assert_eq!(s.run_due(now), 3);
        let ids: Vec<_> = fired.lock().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, ["a-panics", "b-errors", "c-ok"]);
        assert!(s.jobs().is_empty());
    }

    #[test]
    fn callback_can_schedule_and_cancel() {
        let s = scheduler();
        let table = s.table();
        let now = Local::now();
        s.schedule(ScheduledJob::once(JobId::new("victim"), now + TimeDelta::hours(1), JobPayload::new("v")))
            .unwrap();

        s.set_callback(move |job| {
            table.cancel(&JobId::new("victim"));
            table.schedule_delay(JobPayload::new(format!("follow-up-{}", job.id)), TimeDelta::hours(1))?;
            Ok(())
        });
        s.schedule(ScheduledJob::once(JobId::new("trigger"), now, JobPayload::new("t")))
            .unwrap();

        assert_eq!(s.run_due(now), 1);
        let jobs = s.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload.profile_path, PathBuf::from("follow-up-trigger"));
    }

    #[test]
    fn jobs_are_sorted_by_due_time() {
        let s = scheduler();
        let now = Local::now();
        s.schedule(ScheduledJob::once(JobId::new("late"), now + TimeDelta::hours(2), JobPayload::default()))
            .unwrap();
        s.schedule(ScheduledJob::once(JobId::new("early"), now + TimeDelta::hours(1), JobPayload::default()))
            .unwrap();
        let ids: Vec<_> = s.jobs().into_iter().map(|j| j.id.to_string()).collect();
        assert_eq!(ids, ["early", "late"]);
    }

    #[test]
    fn stop_without_start_is_noop() {
        let s = scheduler();
        assert!(!s.is_running());
        assert!(s.stop());
    }
}
