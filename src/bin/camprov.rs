use anyhow::{bail, Context, Result};
use camera_provenance::{
    capture, extract, CaptureOptions, DeviceKey, Extraction, InMemoryRegistry, KeyRegistry,
    KeyRegistryClient, KeyResolution, ProvenanceConfig, RetryPolicy, RpcRegistry, Verifier,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "camprov")]
#[command(about = "Sign photographs at capture time and verify their provenance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RegistryArgs {
    /// JSON file mapping model identifiers to hex public keys
    #[arg(long, conflicts_with = "config", required_unless_present = "config")]
    registry_file: Option<PathBuf>,

    /// JSON config pointing at a JSON-RPC registry deployment
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a device key and write it as PKCS#8 PEM
    Keygen {
        /// Where to write the private key
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Hash, sign and embed a provenance record into an image
    Sign {
        /// Image to sign (JPEG or PNG)
        input: PathBuf,

        /// Where to write the signed image
        output: PathBuf,

        /// Device private key (PKCS#8 PEM)
        #[arg(long)]
        key: PathBuf,

        /// Model identifier claimed by the device
        #[arg(long)]
        model: String,

        /// Leave the advisory digest out of the record
        #[arg(long)]
        no_digest: bool,
    },
    /// Print the provenance record embedded in an image
    Extract {
        /// Image to read
        image: PathBuf,
    },
    /// Verify an image's provenance against the registry
    Verify {
        /// Image to verify
        image: PathBuf,

        #[command(flatten)]
        registry: RegistryArgs,

        /// Output result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Look up the public key registered for a model identifier
    Resolve {
        /// Model identifier
        identifier: String,

        #[command(flatten)]
        registry: RegistryArgs,
    },
    /// Register a device's public key under a model identifier
    Publish {
        /// Model identifier
        identifier: String,

        /// Device private key (PKCS#8 PEM)
        #[arg(long)]
        key: PathBuf,

        #[command(flatten)]
        registry: RegistryArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { output, force } => keygen_command(&output, force),
        Commands::Sign {
            input,
            output,
            key,
            model,
            no_digest,
        } => sign_command(&input, &output, &key, &model, no_digest),
        Commands::Extract { image } => extract_command(&image),
        Commands::Verify {
            image,
            registry,
            json,
        } => verify_command(&image, &registry, json),
        Commands::Resolve {
            identifier,
            registry,
        } => resolve_command(&identifier, &registry),
        Commands::Publish {
            identifier,
            key,
            registry,
        } => publish_command(&identifier, &key, &registry),
    }
}

/// Registry selected on the command line.
enum Backend {
    File {
        registry: Arc<InMemoryRegistry>,
        path: PathBuf,
    },
    Rpc {
        registry: Arc<RpcRegistry>,
        retry: RetryPolicy,
    },
}

impl Backend {
    fn open(args: &RegistryArgs) -> Result<Self> {
        if let Some(path) = &args.registry_file {
            let registry = if path.exists() {
                InMemoryRegistry::from_file(path)
                    .with_context(|| format!("Failed to load registry file {}", path.display()))?
            } else {
                InMemoryRegistry::new()
            };
            return Ok(Self::File {
                registry: Arc::new(registry),
                path: path.clone(),
            });
        }

        let Some(config_path) = &args.config else {
            bail!("Either --registry-file or --config is required");
        };
        let config = ProvenanceConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?;
        let registry = RpcRegistry::from_config(&config.registry)
            .context("Failed to create registry client")?;
        Ok(Self::Rpc {
            registry: Arc::new(registry),
            retry: config.registry.retry,
        })
    }

    fn client(&self) -> KeyRegistryClient {
        match self {
            Self::File { registry, .. } => {
                KeyRegistryClient::new(registry.clone(), RetryPolicy::none())
            }
            Self::Rpc { registry, retry } => KeyRegistryClient::new(registry.clone(), retry.clone()),
        }
    }

    fn registry(&self) -> &dyn KeyRegistry {
        match self {
            Self::File { registry, .. } => registry.as_ref(),
            Self::Rpc { registry, .. } => registry.as_ref(),
        }
    }
}

fn load_key(path: &Path) -> Result<DeviceKey> {
    DeviceKey::from_pem_file(path)
        .with_context(|| format!("Failed to load device key {}", path.display()))
}

fn keygen_command(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            output.display()
        );
    }

    let key = DeviceKey::generate();
    std::fs::write(output, key.to_pem()?)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("[OK] Device key written to {}", output.display());
    println!("  Public Key: {}", hex::encode(key.public_key_bytes()));
    Ok(())
}

fn sign_command(
    input: &Path,
    output: &Path,
    key_path: &Path,
    model: &str,
    no_digest: bool,
) -> Result<()> {
    let key = load_key(key_path)?;
    let options = CaptureOptions {
        include_digest: !no_digest,
    };

    let signed = capture::sign_image_file(input, output, model, &key, options)
        .with_context(|| format!("Failed to sign {}", input.display()))?;

    println!("[OK] Signed image written to {}", output.display());
    println!("  Model:        {}", signed.record.model_identifier);
    println!("  Content Hash: {}", signed.digest);
    println!("  Signature:    {}", hex::encode(&signed.record.signature));
    Ok(())
}

fn extract_command(path: &Path) -> Result<()> {
    let image =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    match extract(&image) {
        Extraction::Found(record) => {
            let json =
                serde_json::to_string_pretty(&record).context("Failed to serialize record")?;
            println!("{}", json);
            Ok(())
        }
        Extraction::NoMetadata => {
            println!("[FAILED] No provenance metadata found");
            bail!("No provenance metadata in {}", path.display())
        }
        Extraction::Malformed(reason) => {
            println!("[FAILED] Malformed provenance metadata: {}", reason);
            bail!("Malformed provenance metadata in {}", path.display())
        }
        Extraction::UnsupportedFormat => {
            println!("[FAILED] Unsupported image format");
            bail!("Unsupported image format: {}", path.display())
        }
    }
}

fn verify_command(path: &Path, args: &RegistryArgs, json_output: bool) -> Result<()> {
    let backend = Backend::open(args)?;
    let verifier = Verifier::new(backend.client());

    let result = verifier
        .verify_file(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    if json_output {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
        println!("{}", json);
    } else {
        println!("Verifying: {}", path.display());
        if let Some(model) = &result.model_identifier {
            println!("  Model:        {}", model);
        }
        if let Some(digest) = &result.digest {
            println!("  Content Hash: {}", digest);
        }
        if result.advisory_digest_match == Some(false) {
            println!("  [WARN] Embedded digest does not match the image content");
        }
        if result.is_verified() {
            println!("[OK] {}", result.outcome);
        } else {
            match &result.detail {
                Some(detail) => println!("[FAILED] {}: {}", result.outcome, detail),
                None => println!("[FAILED] {}", result.outcome),
            }
        }
    }

    if result.is_verified() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Verification failed: {}", result.outcome))
    }
}

fn resolve_command(identifier: &str, args: &RegistryArgs) -> Result<()> {
    let backend = Backend::open(args)?;

    match backend.client().resolve(identifier) {
        KeyResolution::Key(key) => {
            println!("Model: {}", identifier);
            println!("Public Key: {}", hex::encode(key));
            Ok(())
        }
        KeyResolution::NotRegistered => {
            println!("No key registered for model: {}", identifier);
            bail!("Key not registered")
        }
        KeyResolution::Unavailable(reason) => {
            println!("[FAILED] Registry unavailable: {}", reason);
            bail!("Registry unavailable")
        }
    }
}

fn publish_command(identifier: &str, key_path: &Path, args: &RegistryArgs) -> Result<()> {
    let key = load_key(key_path)?;
    let backend = Backend::open(args)?;

    capture::register_device(backend.registry(), identifier, &key)
        .with_context(|| format!("Failed to register key for {}", identifier))?;

    if let Backend::File { registry, path } = &backend {
        registry
            .save(path)
            .with_context(|| format!("Failed to write registry file {}", path.display()))?;
    }

    println!("[OK] Registered key for model: {}", identifier);
    println!("  Public Key: {}", hex::encode(key.public_key_bytes()));
    Ok(())
}
