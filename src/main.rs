extern crate postgres;
extern crate chrono;
extern crate serde_json;
extern crate log;
extern crate log4rs;
extern crate ctrlc;
extern crate clap;

use std::sync::{Arc, atomic::AtomicBool};
use std::sync::atomic::Ordering;
use std::thread;

use serde::{Serialize, Deserialize};

use std::process::exit;

use chrono::NaiveDateTime;
use clap::{App, ArgMatches};
use std::fs::File;
use std::io::Read;

mod consumer;
mod database;
mod error;
mod generator;
mod producer;
mod queue;
mod record;

use crate::consumer::{Consumer, ConsumerParameters};
use crate::database::{PostgresStore, DatabaseParameters};
use crate::error::ConfigError;
use crate::producer::{Producer, ProducerParameters};
use crate::queue::QueueParameters;
use crate::queue::json_lines::JsonLinesFile;
use crate::queue::postgres_queue::PostgresQueue;
use crate::record::TIMESTAMP_FORMAT;

static DEFAULT_CONFIGURATION_PATH: &str = "resources/queuelogd.yml";
static DEFAULT_LOG_CONFIGURATION_PATH: &str = "resources/log.yml";
static DB_PASSWORD_VARIABLE: &str = "QUEUELOGD_DB_PASSWORD";

const DEFAULT_QUERY_HOURS: i64 = 72;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Configuration {
    database_connection_parameters: DatabaseParameters,
    #[serde(default)]
    queue_parameters: QueueParameters,
    #[serde(default)]
    producer_parameters: ProducerParameters,
    #[serde(default)]
    consumer_parameters: ConsumerParameters,
}

impl Configuration {
    fn load(path: &str) -> Result<Configuration, ConfigError> {
        let mut configuration_string = String::new();
        File::open(path)
            .and_then(|mut file| file.read_to_string(&mut configuration_string))
            .map_err(|source| ConfigError::Read { path: path.to_string(), source })?;

        let mut configuration = Configuration::from_yaml(configuration_string.as_str())?;
        configuration.apply_password_override(std::env::var(DB_PASSWORD_VARIABLE).ok());
        Ok(configuration)
    }

    fn from_yaml(configuration_string: &str) -> Result<Configuration, ConfigError> {
        let configuration = serde_yaml::from_str::<Configuration>(configuration_string)?;
        configuration.validate()?;
        Ok(configuration)
    }

    fn apply_password_override(&mut self, password: Option<String>) {
        if let Some(password) = password {
            self.database_connection_parameters.password = password;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let database = &self.database_connection_parameters;
        if database.tls_enable && database.tls_params.is_none() {
            return Err(ConfigError::Invalid(String::from("tls_enable is set but tls_params are missing")));
        }
        if self.producer_parameters.batch_size == 0 {
            return Err(ConfigError::Invalid(String::from("producer batch_size must be at least 1")));
        }
        if self.consumer_parameters.wait_time_secs == 0 {
            return Err(ConfigError::Invalid(String::from("consumer wait_time_secs must be at least 1")));
        }
        if self.consumer_parameters.max_messages == 0 || self.consumer_parameters.max_messages > queue::MAX_POLL_MESSAGES {
            log::warn!(target: "queuelogd", "consumer max_messages {} is clamped to 1..={}",
                       self.consumer_parameters.max_messages, queue::MAX_POLL_MESSAGES);
        }
        Ok(())
    }
}

fn connect_queue(configuration: &Configuration) -> PostgresQueue {
    match PostgresQueue::connect(&configuration.database_connection_parameters, &configuration.queue_parameters) {
        Ok(queue) => queue,
        Err(err) => {
            log::error!(target: "queuelogd", "Cannot connect to the queue: \'{}\'", err);
            exit(201);
        }
    }
}

fn parse_number<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Option<T> {
    let value = matches.value_of(name)?;
    match value.parse::<T>() {
        Ok(number) => Some(number),
        Err(_) => {
            log::error!(target: "queuelogd", "Invalid value for --{}: \'{}\'", name, value);
            exit(102);
        }
    }
}

fn produce(configuration: &Configuration, matches: &ArgMatches) {
    let count = parse_number::<usize>(matches, "count").unwrap_or(configuration.producer_parameters.batch_size);

    let report = match matches.value_of("output") {
        Some(path) => match JsonLinesFile::open(path) {
            Ok(file) => Producer::new(file).produce_generated(count),
            Err(err) => {
                log::error!(target: "queuelogd", "Cannot open output file \'{}\': \'{}\'", path, err);
                exit(203);
            }
        },
        None => Producer::new(connect_queue(configuration)).produce_generated(count),
    };

    if !report.all_sent() {
        log::error!(target: "queuelogd", "{} of {} readings could not be sent: {}",
                    report.failures.len(), count, report.failure_summary());
        exit(310);
    }
}

fn consume(configuration: &Configuration, matches: &ArgMatches) {
    let store = PostgresStore::new(configuration.database_connection_parameters.clone());
    let mut consumer = Consumer::new(connect_queue(configuration), store, &configuration.consumer_parameters);

    if matches.is_present("once") {
        if let Err(err) = consumer.poll_once() {
            log::error!(target: "queuelogd", "Poll cycle failed: \'{}\'", err);
            exit(311);
        }
        return;
    }

    let terminate_programm = Arc::new(AtomicBool::new(false));
    let terminate_consumer_thread = Arc::clone(&terminate_programm);

    let consumer_thread = match thread::Builder::new()
        .name("consumer".to_string())
        .spawn(move || consumer.run(&terminate_consumer_thread)) {
        Ok(consumer_handle) => consumer_handle,
        Err(err) => {
            log::error!(target: "queuelogd", "Cannot start the consumer thread: \'{}\'", err);
            exit(202);
        }
    };

    ctrlc::set_handler(move || {
        log::info!(target: "queuelogd", "Termination signal received!");
        terminate_programm.store(true, Ordering::SeqCst);
    }).expect("Error setting Ctrl-C handler");

    match consumer_thread.join() {
        Ok(Ok(())) => log::debug!(target: "queuelogd", "Joined consumer thread!"),
        Ok(Err(err)) => {
            log::error!(target: "queuelogd", "Consumer stopped, queue unreachable: \'{}\'", err);
            exit(314);
        }
        Err(_) => {
            log::error!(target: "queuelogd", "Could not join the consumer thread!");
            exit(301);
        }
    };
}

/// Start of a window of `hours` ending at `now`. `None` for negative or unrepresentable windows.
fn window_start(now: NaiveDateTime, hours: i64) -> Option<NaiveDateTime> {
    if hours < 0 {
        return None;
    }
    now.checked_sub_signed(chrono::Duration::try_hours(hours)?)
}

fn query(configuration: &Configuration, matches: &ArgMatches) {
    let hours = parse_number::<i64>(matches, "hours").unwrap_or(DEFAULT_QUERY_HOURS);
    let since = match window_start(chrono::Local::now().naive_local(), hours) {
        Some(since) => since,
        None => {
            log::error!(target: "queuelogd", "Invalid value for --hours: \'{}\'", hours);
            exit(102);
        }
    };

    let store = PostgresStore::new(configuration.database_connection_parameters.clone());
    let readings = match database::recent_readings(&store, since) {
        Ok(readings) => readings,
        Err(err) => {
            log::error!(target: "queuelogd", "Cannot fetch readings: \'{}\'", err);
            exit(312);
        }
    };

    println!("{:>6} {:>11} {:>8} {:>19}", "id", "temperature", "humidity", "timestamp");
    for reading in &readings {
        println!("{:>6} {:>11.2} {:>8.2} {:>19}",
                 reading.id, reading.temperature, reading.humidity, reading.timestamp.format(TIMESTAMP_FORMAT));
    }
    log::info!(target: "queuelogd", "Total rows fetched: {}", readings.len());
}

fn migrate(configuration: &Configuration) {
    if let Err(err) = database::migrate(&configuration.database_connection_parameters) {
        log::error!(target: "queuelogd", "Cannot create the database schema: \'{}\'", err);
        exit(313);
    }
}

fn main() {
    let cli_yaml = clap::load_yaml!("cli.yml");
    let matches = App::from_yaml(cli_yaml).get_matches();

    let log_configuration_path = matches.value_of("log_config").unwrap_or(DEFAULT_LOG_CONFIGURATION_PATH);
    match log4rs::init_file(log_configuration_path, Default::default()) {
        Ok(_) => {},
        Err(err) => {
            eprintln!("Could not create logger from yaml configuration: {}", err);
            exit(100);
        }
    };

    let configuration_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIGURATION_PATH);
    let configuration = match Configuration::load(configuration_path) {
        Ok(configuration) => configuration,
        Err(err) => {
            log::error!(target: "queuelogd", "{}", err);
            exit(101);
        }
    };

    match matches.subcommand() {
        ("produce", Some(sub_matches)) => produce(&configuration, sub_matches),
        ("consume", Some(sub_matches)) => consume(&configuration, sub_matches),
        ("query", Some(sub_matches)) => query(&configuration, sub_matches),
        ("migrate", Some(_)) => migrate(&configuration),
        _ => {
            log::error!(target: "queuelogd", "No subcommand given!");
            exit(103);
        }
    }

    log::info!(target: "queuelogd", "Exiting");
    exit(0);
}
