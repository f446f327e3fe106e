//! CLI argument parsing module
//!
//! Handles command-line argument parsing using `clap` derive macros.
//! Flags either build a [`LoadPlan`] on their own or override the values of
//! one loaded with `--plan`.

use std::path::PathBuf;

use clap::Parser;
use rumqttc::QoS;

use crate::client::ClientKind;
use crate::config::{parse_qos, LoadPlan, MessageSource, Mode};
use crate::error::MqttSamplerError;

/// Command-line arguments for the MQTT sampler.
///
/// Every plan setting is optional here so that an unset flag leaves the
/// plan file's value (or the built-in default) untouched.
///
/// # Example
///
/// ```rust,ignore
/// use clap::Parser;
/// use mqtt_sampler::cli::Args;
///
/// let args = Args::parse();
/// let plan = args.into_plan()?;
/// ```
#[derive(Parser, Debug, Default)]
#[command(name = "mqtt-sampler")]
#[command(about = "Run MQTT publish/subscribe load samples against a broker")]
#[command(version)]
pub struct Args {
    /// Sampler to run: publish or subscribe
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// JSON load plan; other flags override its values
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Broker URL, e.g. tcp://localhost:1883 or ssl://broker:8883
    #[arg(long)]
    pub broker_url: Option<String>,

    /// MQTT client ID (generated when omitted; suffixed per user when threads > 1)
    #[arg(long)]
    pub client_id: Option<String>,

    /// Topic to publish to or subscribe to
    #[arg(short = 't', long)]
    pub topic: Option<String>,

    /// QoS: 0, 1, 2 or at_most_once, at_least_once, exactly_once
    #[arg(long, value_parser = parse_qos_arg)]
    pub qos: Option<QoS>,

    /// Client variant: blocking or async
    #[arg(long, value_enum)]
    pub client_type: Option<ClientKind>,

    /// Number of virtual users
    #[arg(long)]
    pub threads: Option<usize>,

    /// Samples per virtual user (0 runs until Ctrl+C)
    #[arg(long)]
    pub iterations: Option<u64>,

    /// Subscriber receive timeout in seconds (0 waits until interrupted)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Receive on a side thread and log messages until the timeout
    #[arg(long, default_value = "false")]
    pub background: bool,

    /// Publisher payload text
    #[arg(long, conflicts_with = "message_file")]
    pub message: Option<String>,

    /// Publisher payload read from a file
    #[arg(long)]
    pub message_file: Option<PathBuf>,

    /// Publish with the retained flag
    #[arg(long, default_value = "false")]
    pub retained: bool,

    /// Start with a clean session
    #[arg(long, default_value = "false")]
    pub clean_session: bool,

    /// Keep-alive interval in seconds (0 disables)
    #[arg(long)]
    pub keep_alive: Option<u64>,

    /// Username for authentication (empty disables credentials)
    #[arg(long)]
    pub username: Option<String>,

    /// Password for authentication
    #[arg(long)]
    pub password: Option<String>,

    /// Capacity of each subscription's inbound buffer
    #[arg(long)]
    pub buffer_capacity: Option<usize>,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print every sample and the summary as JSON lines
    #[arg(long, default_value = "false")]
    pub json: bool,
}

fn parse_qos_arg(value: &str) -> Result<QoS, String> {
    parse_qos(value).map_err(|e| e.to_string())
}

impl Args {
    /// Validate argument combinations that clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.mode.is_none() && self.plan.is_none() {
            return Err("--mode is required unless --plan is given".to_string());
        }
        if self.threads == Some(0) {
            return Err("--threads must be at least 1".to_string());
        }
        if self.buffer_capacity == Some(0) {
            return Err("--buffer-capacity must be at least 1".to_string());
        }
        if self.log_level().is_none() {
            return Err(format!(
                "Invalid log level: {}. Must be error, warn, info, debug or trace.",
                self.log_level
            ));
        }
        Ok(())
    }

    /// The parsed `--log-level`, if it is one of the known levels.
    pub fn log_level(&self) -> Option<tracing::Level> {
        self.log_level.parse().ok()
    }

    /// Builds the load plan: `--plan` (or defaults) overridden by flags.
    pub fn into_plan(self) -> Result<LoadPlan, MqttSamplerError> {
        let mut plan = match &self.plan {
            Some(path) => LoadPlan::from_file(path)?,
            None => LoadPlan::default(),
        };

        if let Some(mode) = self.mode {
            plan.mode = mode;
        }
        if let Some(threads) = self.threads {
            plan.threads = threads;
        }
        if let Some(iterations) = self.iterations {
            plan.iterations = iterations;
        }

        let connection = &mut plan.connection;
        if let Some(url) = self.broker_url {
            connection.broker_url = url;
        }
        if let Some(id) = self.client_id {
            connection.client_id = id;
        }
        if let Some(kind) = self.client_type {
            connection.client_type = kind;
        }
        if self.clean_session {
            connection.clean_session = true;
        }
        if let Some(secs) = self.keep_alive {
            connection.keep_alive_secs = secs;
        }
        if let Some(username) = self.username {
            connection.username = Some(username);
        }
        if let Some(password) = self.password {
            connection.password = Some(password);
        }
        if let Some(capacity) = self.buffer_capacity {
            connection.buffer_capacity = capacity;
        }

        if let Some(topic) = self.topic {
            plan.publisher.topic = topic.clone();
            plan.subscriber.topic = topic;
        }
        if let Some(qos) = self.qos {
            plan.publisher.qos = qos;
            plan.subscriber.qos = qos;
        }
        if let Some(text) = self.message {
            plan.publisher.message = MessageSource::Text(text);
        }
        if let Some(path) = self.message_file {
            plan.publisher.message = MessageSource::File(path);
        }
        if self.retained {
            plan.publisher.retained = true;
        }
        if let Some(secs) = self.timeout {
            plan.subscriber.timeout_secs = secs;
        }
        if self.background {
            plan.subscriber.background = true;
        }

        plan.validate()?;
        Ok(plan)
    }
}
