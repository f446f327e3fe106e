//! Load runner
//!
//! Drives a [`LoadPlan`]: one OS thread per virtual user, each running its
//! sampler for the configured number of iterations. All users share one
//! [`ClientRegistry`] and one [`InterruptFlag`]. When every user has
//! finished (or the flag was raised), whatever is still registered is closed
//! and the run's [`RunSummary`] is returned.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{LoadPlan, Mode};
use crate::error::MqttSamplerError;
use crate::registry::ClientRegistry;
use crate::sampler::{InterruptFlag, PublisherSampler, SampleResult, SubscriberSampler};

/// Called with every finished sample, from the user thread that ran it.
pub type SampleObserver = Arc<dyn Fn(&SampleResult) + Send + Sync>;

/// Totals for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub mode: String,
    pub threads: usize,
    pub samples: u64,
    pub successes: u64,
    pub failures: u64,
    /// Payload bytes of successful samples.
    pub bytes: u64,
    /// Users whose setup failed before their first sample.
    pub aborted_users: usize,
    pub interrupted: bool,
    pub teardown_errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl RunSummary {
    /// True when every sample succeeded and teardown was clean.
    pub fn is_success(&self) -> bool {
        self.failures == 0 && self.aborted_users == 0 && self.teardown_errors.is_empty()
    }

    fn absorb(&mut self, user: UserTotals) {
        self.samples += user.samples;
        self.successes += user.successes;
        self.failures += user.failures;
        self.bytes += user.bytes;
        if user.aborted {
            self.aborted_users += 1;
        }
    }
}

#[derive(Debug, Default)]
struct UserTotals {
    samples: u64,
    successes: u64,
    failures: u64,
    bytes: u64,
    aborted: bool,
}

impl UserTotals {
    fn record(&mut self, result: &SampleResult) {
        self.samples += 1;
        if result.success {
            self.successes += 1;
            self.bytes += result.bytes as u64;
        } else {
            self.failures += 1;
        }
    }
}

/// Runs a load plan.
pub struct LoadRunner {
    plan: LoadPlan,
    registry: Arc<ClientRegistry>,
    interrupt: InterruptFlag,
    observer: Option<SampleObserver>,
}

impl LoadRunner {
    /// Validates `plan` and prepares a runner with a fresh registry.
    pub fn new(plan: LoadPlan) -> Result<Self, MqttSamplerError> {
        plan.validate()?;
        Ok(Self {
            plan,
            registry: Arc::new(ClientRegistry::new()),
            interrupt: InterruptFlag::new(),
            observer: None,
        })
    }

    /// Shares an externally owned interrupt flag (e.g. one raised on Ctrl+C).
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_observer(mut self, observer: SampleObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn plan(&self) -> &LoadPlan {
        &self.plan
    }

    pub fn interrupt(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Runs every virtual user to completion and tears down.
    ///
    /// An `iterations` of zero keeps each user sampling until the interrupt
    /// flag is raised.
    pub fn run(&self) -> Result<RunSummary, MqttSamplerError> {
        let started = Instant::now();
        let mut summary = RunSummary {
            mode: self.plan.mode.to_string(),
            threads: self.plan.threads,
            started_at: Some(Utc::now()),
            ..RunSummary::default()
        };
        info!(
            "Starting {} run: {} user(s) x {} iteration(s) against {}",
            self.plan.mode,
            self.plan.threads,
            self.plan.iterations,
            self.plan.connection.broker_url
        );

        let mut users = Vec::with_capacity(self.plan.threads);
        for index in 0..self.plan.threads {
            let client_id = self.plan.connection.user_client_id(self.plan.threads, index);
            let user = VirtualUser {
                plan: self.plan.clone(),
                client_id: client_id.clone(),
                registry: Arc::clone(&self.registry),
                interrupt: self.interrupt.clone(),
                observer: self.observer.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("mqtt-user-{}", index + 1))
                .spawn(move || user.run());
            match spawned {
                Ok(handle) => users.push((client_id, handle)),
                Err(e) => {
                    // Stop the users already started before bailing out.
                    self.interrupt.raise();
                    join_users(users, &mut summary);
                    self.registry.close_all();
                    return Err(MqttSamplerError::Io(e));
                }
            }
        }

        join_users(users, &mut summary);

        summary.interrupted = self.interrupt.is_raised();
        summary.teardown_errors = self
            .registry
            .close_all()
            .iter()
            .map(ToString::to_string)
            .collect();
        summary.elapsed = started.elapsed();

        info!(
            "Run finished in {:?}: {} sample(s), {} ok, {} failed",
            summary.elapsed, summary.samples, summary.successes, summary.failures
        );
        Ok(summary)
    }
}

fn join_users(users: Vec<(String, thread::JoinHandle<UserTotals>)>, summary: &mut RunSummary) {
    for (client_id, handle) in users {
        match handle.join() {
            Ok(totals) => summary.absorb(totals),
            Err(_) => {
                warn!("Virtual user {} panicked", client_id);
                summary.aborted_users += 1;
            }
        }
    }
}

struct VirtualUser {
    plan: LoadPlan,
    client_id: String,
    registry: Arc<ClientRegistry>,
    interrupt: InterruptFlag,
    observer: Option<SampleObserver>,
}

impl VirtualUser {
    fn run(self) -> UserTotals {
        match self.plan.mode {
            Mode::Publish => {
                let mut sampler = PublisherSampler::new(
                    self.plan.connection.clone(),
                    self.plan.publisher.clone(),
                    self.client_id.clone(),
                    Arc::clone(&self.registry),
                );
                if let Err(e) = sampler.thread_started() {
                    warn!("Publisher {} not started: {}", self.client_id, e);
                    return UserTotals {
                        aborted: true,
                        ..UserTotals::default()
                    };
                }
                let totals = self.iterate(|| sampler.sample());
                sampler.thread_finished();
                totals
            }
            Mode::Subscribe => {
                let mut sampler = SubscriberSampler::new(
                    self.plan.connection.clone(),
                    self.plan.subscriber.clone(),
                    self.client_id.clone(),
                    Arc::clone(&self.registry),
                    self.interrupt.clone(),
                );
                if let Err(e) = sampler.thread_started() {
                    warn!("Subscriber {} not started: {}", self.client_id, e);
                    return UserTotals {
                        aborted: true,
                        ..UserTotals::default()
                    };
                }
                let totals = self.iterate(|| sampler.sample());
                sampler.thread_finished();
                totals
            }
        }
    }

    fn iterate(&self, mut sample: impl FnMut() -> SampleResult) -> UserTotals {
        let mut totals = UserTotals::default();
        let mut iteration = 0u64;
        while self.plan.iterations == 0 || iteration < self.plan.iterations {
            if self.interrupt.is_raised() {
                debug!("User {} interrupted after {} sample(s)", self.client_id, iteration);
                break;
            }
            let result = sample();
            totals.record(&result);
            if let Some(observer) = &self.observer {
                observer(&result);
            }
            iteration += 1;
        }
        totals
    }
}

fn serialize_millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}
