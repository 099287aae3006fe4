//! Module for connecting to a postgres database and storing the readings taken off the queue in
//! the database.
use chrono::NaiveDateTime;
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use postgres::{Client, Row};
use postgres_openssl::MakeTlsConnector;
use serde::{Deserialize, Serialize};

use crate::error::PersistError;
use crate::record::SensorReading;

static SQL_CREATE_TABLES: &'static str = include_str!("sql/create_tables.sql");

static SQL_INSERT_READING: &'static str = include_str!("sql/insert_reading.sql");
static SQL_SELECT_READINGS_SINCE: &'static str = include_str!("sql/select_readings_since.sql");
static SQL_SELECT_LATEST_READINGS: &'static str = include_str!("sql/select_latest_readings.sql");

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct modeling the parameters required for a database connection.
///
/// This includes SSL/TLS encryption.
pub struct DatabaseParameters
{
    /// The hostname of the database server.
    pub hostname: String,
    /// The port for the database server.
    pub port: u32,
    /// The username to connect as.
    pub username: String,
    /// The password to connect with.
    pub password: String,
    /// The database to open on the server.
    pub database: String,
    /// Flag to enable tls for the database server connection.
    pub tls_enable: bool,
    /// Parameters for the tls connection to the database server.
    pub tls_params: Option<DatabaseTlsParameters>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct for the parameters required for a tls connection to the database.
pub struct DatabaseTlsParameters {
    /// The path to the server certificate for TLS encryption.
    pub server_ca_path: String,
    /// The path to the client certificate for TLS encryption.
    pub client_cert_path: String,
    /// The path to the client key for TLS encryption.
    pub client_key_path: String,
}

impl DatabaseParameters {
    fn connection_string(&self) -> String {
        format!("user={} password={} host={} port={} dbname={} application_name=queuelogd",
                self.username,
                self.password,
                self.hostname,
                self.port,
                self.database)
    }
}

/// Capability of the storage the readings end up in.
pub trait ReadingStore {
    /// Appends exactly one row for `reading`. No retry happens in here.
    fn insert_reading(&self, reading: &SensorReading) -> Result<(), PersistError>;

    /// All readings newer than `since`, oldest first.
    fn readings_since(&self, since: NaiveDateTime) -> Result<Vec<SensorReading>, PersistError>;

    /// The `limit` newest readings, newest first.
    fn latest_readings(&self, limit: i64) -> Result<Vec<SensorReading>, PersistError>;
}

/// Function to open a connection to the database.
///
/// # Arguments
///
/// * `connection_parameters` - Parameters for the database connection.
///
/// # Errors
///
/// Errors occur when one of the following conditions is met:
///
/// * TLS is enabled without TLS parameters.
///
/// * The files for the TLS connection cannot be found.
///
/// * The connection cannot be established.
///
/// * The user is not authorized for the database.
///
pub fn connect(connection_parameters: &DatabaseParameters) -> Result<Client, PersistError>
{
    let postgres_connection_string = connection_parameters.connection_string();

    if !connection_parameters.tls_enable {
        return Client::connect(postgres_connection_string.as_str(), postgres::NoTls)
            .map_err(PersistError::Connect);
    }

    let tls_params = connection_parameters.tls_params.as_ref().ok_or_else(|| {
        PersistError::Unavailable(String::from("TLS enabled but no TLS parameters specified!"))
    })?;

    let mut ssl_connection_builder = SslConnector::builder(SslMethod::tls())?;
    ssl_connection_builder.set_verify(SslVerifyMode::PEER);
    ssl_connection_builder.set_ca_file(&tls_params.server_ca_path)?;
    ssl_connection_builder.set_certificate_file(&tls_params.client_cert_path, SslFiletype::PEM)?;
    ssl_connection_builder.set_private_key_file(&tls_params.client_key_path, SslFiletype::PEM)?;

    let tls_connector = MakeTlsConnector::new(ssl_connection_builder.build());
    Client::connect(postgres_connection_string.as_str(), tls_connector)
        .map_err(PersistError::Connect)
}

/// Creates the readings table and the queue table if they do not exist yet.
pub fn migrate(connection_parameters: &DatabaseParameters) -> Result<(), PersistError>
{
    let mut client = connect(connection_parameters)?;
    client.batch_execute(SQL_CREATE_TABLES).map_err(PersistError::Statement)?;
    log::info!(target: "queuelogd::db", "Database schema is up to date!");
    Ok(())
}

/// Store writing to the `sensor_data` table.
///
/// Every call opens its own connection and drops it before returning, whatever the outcome.
pub struct PostgresStore {
    connection_parameters: DatabaseParameters,
}

impl PostgresStore {
    pub fn new(connection_parameters: DatabaseParameters) -> PostgresStore {
        PostgresStore { connection_parameters }
    }

    fn query(&self, statement: &str, params: &[&(dyn postgres::types::ToSql + Sync)]) -> Result<Vec<SensorReading>, PersistError> {
        let mut client = connect(&self.connection_parameters)?;
        let rows = client.query(statement, params).map_err(PersistError::Statement)?;
        rows.iter().map(reading_from_row).collect()
    }
}

fn reading_from_row(row: &Row) -> Result<SensorReading, PersistError> {
    Ok(SensorReading {
        id: row.try_get("id").map_err(PersistError::Statement)?,
        temperature: row.try_get("temperature").map_err(PersistError::Statement)?,
        humidity: row.try_get("humidity").map_err(PersistError::Statement)?,
        timestamp: row.try_get("timestamp").map_err(PersistError::Statement)?,
    })
}

impl ReadingStore for PostgresStore {
    fn insert_reading(&self, reading: &SensorReading) -> Result<(), PersistError> {
        let mut client = connect(&self.connection_parameters)?;

        client
            .execute(SQL_INSERT_READING,
                     &[&reading.id, &reading.temperature, &reading.humidity, &reading.timestamp])
            .map_err(PersistError::Statement)?;

        log::trace!(target: "queuelogd::db", "Inserted reading {} taken at {}", reading.id, reading.timestamp);
        Ok(())
    }

    fn readings_since(&self, since: NaiveDateTime) -> Result<Vec<SensorReading>, PersistError> {
        self.query(SQL_SELECT_READINGS_SINCE, &[&since])
    }

    fn latest_readings(&self, limit: i64) -> Result<Vec<SensorReading>, PersistError> {
        self.query(SQL_SELECT_LATEST_READINGS, &[&limit])
    }
}

/// Number of rows shown when no reading is newer than the requested point in time.
pub const FALLBACK_READING_LIMIT: i64 = 1000;

/// Readings newer than `since`, oldest first.
///
/// Falls back to the newest `FALLBACK_READING_LIMIT` readings, newest first, when nothing was
/// recorded after `since`.
pub fn recent_readings<S: ReadingStore + ?Sized>(store: &S, since: NaiveDateTime) -> Result<Vec<SensorReading>, PersistError>
{
    let readings = store.readings_since(since)?;
    if !readings.is_empty() {
        return Ok(readings);
    }

    log::info!(target: "queuelogd::db", "No readings since {}, fetching the latest {} readings", since, FALLBACK_READING_LIMIT);
    store.latest_readings(FALLBACK_READING_LIMIT)
}
