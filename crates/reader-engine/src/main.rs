//! `card-reader` command-line entry point.
//!
//! Loads the configuration, builds a transport, wires a
//! [`CardReaderService`] around it, and runs one command:
//!
//! ```text
//! card-reader scan                      list attached readers
//! card-reader pay --amount 1.00         run one transaction, print the
//!                                       gateway JSON payload
//! ```
//!
//! `--simulate` swaps the USB reader for the in-memory simulation, which
//! answers a start command with a scripted contactless tap.  Progress
//! notifications are printed to stderr; only the payload goes to stdout, so
//! the output can be piped straight into a gateway client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reader_core::protocol::card_data::tags;
use reader_core::protocol::tlv::encode_tlv;
use reader_core::{Amount, DeviceMessage, DeviceTransactionStatus};
use reader_engine::application::notifier::Notification;
use reader_engine::application::service::{CardReaderService, ServiceOptions};
use reader_engine::application::transport::{DeviceId, DeviceTransport};
use reader_engine::infrastructure::storage::config::{load_config, BackendKind, ReaderConfig};
use reader_engine::infrastructure::transport::MockTransport;

#[derive(Debug, Parser)]
#[command(name = "card-reader", version, about = "Card-present transaction engine")]
struct Cli {
    /// Configuration file (defaults to the platform config directory).
    #[arg(long, env = "CARD_READER_CONFIG")]
    config: Option<PathBuf>,

    /// Use the simulated reader instead of USB hardware.
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List attached card readers.
    Scan,
    /// Run one transaction and print the gateway payload.
    Pay {
        /// Amount to charge, e.g. `1.00`.
        #[arg(long)]
        amount: Amount,
        /// Seconds to wait for the card (defaults to the configured value).
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    let simulate = cli.simulate || config.reader.backend == BackendKind::Simulated;
    let transport = build_transport(&config, simulate)?;
    let service = CardReaderService::new(
        transport,
        ServiceOptions {
            methods: config.transaction.payment_methods(),
            beep_on_completion: config.transaction.beep_on_completion,
            ..ServiceOptions::default()
        },
    );

    let result = match cli.command {
        Command::Scan => scan(&service),
        Command::Pay { amount, timeout } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.transaction.default_timeout());
            pay(&service, &config, amount, timeout).await
        }
    };

    if let Err(e) = service.shutdown() {
        warn!("shutdown: {e}");
    }
    result
}

fn scan(service: &CardReaderService) -> anyhow::Result<()> {
    let devices = service.scan_devices()?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

async fn pay(
    service: &CardReaderService,
    config: &ReaderConfig,
    amount: Amount,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut notifications = service.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(Notification::TransactionStatusChanged { status, message }) => {
                    eprintln!("[{status}] {message}");
                }
                Ok(Notification::DisplayMessage(text)) => eprintln!("reader: {text}"),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("{n} notification(s) skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let wanted = config.reader.serial_number.clone().map(DeviceId);
    let info = service.connect(wanted.as_ref())?;
    info!("using reader {} ({})", info.id, info.serial_number);

    let outcome = {
        let transaction = service.start_transaction(amount, timeout);
        tokio::pin!(transaction);
        tokio::select! {
            outcome = &mut transaction => outcome,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; cancelling transaction");
                service.cancel_transaction();
                transaction.await
            }
        }
    };
    printer.abort();

    match outcome {
        Ok(card) => {
            println!("{}", card.to_gateway_payload().to_json()?);
            Ok(())
        }
        Err(e) => {
            eprintln!("transaction {}: {e}", e.status());
            Err(e.into())
        }
    }
}

fn build_transport(config: &ReaderConfig, simulate: bool) -> anyhow::Result<Arc<dyn DeviceTransport>> {
    if simulate {
        info!("using simulated card reader");
        let mock = MockTransport::with_device(MockTransport::reader_info("SIM0001"));
        mock.queue_start_response(simulated_tap());
        return Ok(Arc::new(mock));
    }
    hid_transport(config)
}

#[cfg(feature = "hidapi")]
fn hid_transport(config: &ReaderConfig) -> anyhow::Result<Arc<dyn DeviceTransport>> {
    use reader_engine::infrastructure::transport::hidapi_backend::HidApiBackend;
    use reader_engine::infrastructure::transport::HidTransport;

    let backend = Arc::new(HidApiBackend::new()?);
    Ok(Arc::new(HidTransport::new(backend, config.hid_transport_config())?))
}

#[cfg(not(feature = "hidapi"))]
fn hid_transport(_config: &ReaderConfig) -> anyhow::Result<Arc<dyn DeviceTransport>> {
    anyhow::bail!("HID support is not built in; rebuild with `--features hidapi` or pass --simulate")
}

/// What the simulated reader does after a start command: detect a
/// contactless card, then return an authorization request.
fn simulated_tap() -> Vec<DeviceMessage> {
    let mut inner = Vec::new();
    inner.extend(encode_tlv(tags::DEVICE_SERIAL_NUMBER, b"SIM0001"));
    inner.extend(encode_tlv(tags::KSN, &[0x95, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01, 0x2A, 0x00, 0x07]));
    inner.extend(encode_tlv(tags::CARD_TYPE, &[0x03]));
    inner.extend(encode_tlv(tags::ENCRYPTED_DATA, &[0x5A, 0x0C, 0xE1, 0x7B, 0x22, 0x90, 0x3F, 0x41]));
    let frame = encode_tlv(&[0xFA], &encode_tlv(&[0xF8], &inner));

    vec![
        DeviceMessage::status(DeviceTransactionStatus::CardDetected),
        DeviceMessage::status(DeviceTransactionStatus::TransactionInProgress),
        DeviceMessage::AuthorizationRequest(frame),
    ]
}
