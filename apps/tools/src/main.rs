use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use device_link::{default_port_identifiers, select_port, SerialBackend, TokioSerialBackend};
use shared::domain::Recipe;
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/recipes.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serial ports visible to the OS; `*` marks the one discovery would pick.
    ListPorts {
        /// Comma-separated identifier substrings.
        #[arg(long)]
        identifiers: Option<String>,
    },
    ListRecipes,
    /// Stores a recipe read from a JSON file.
    ImportRecipe {
        path: std::path::PathBuf,
    },
    ExportRecipe {
        recipe_id: String,
    },
    DeleteRecipe {
        recipe_id: String,
    },
    /// Sweep time in ms for an exact calibration cell.
    Calibrate {
        rpm: u32,
        angle: u32,
    },
    NearestPwm {
        rpm: u32,
    },
    NearestRpm {
        pwm: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::ListPorts { identifiers } => {
            let identifiers = identifiers
                .map(|ids| ids.split(',').map(|id| id.trim().to_string()).collect())
                .unwrap_or_else(default_port_identifiers);
            let ports = TokioSerialBackend.list_ports().await?;
            let chosen = select_port(&ports, &identifiers);
            if ports.is_empty() {
                println!("no serial ports found");
            }
            for port in ports {
                let marker = if chosen.as_deref() == Some(port.path.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{marker} {} manufacturer={} serial={}",
                    port.path,
                    port.manufacturer.as_deref().unwrap_or("-"),
                    port.serial_number.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::ListRecipes => {
            let storage = Storage::new(&cli.database_url).await?;
            for recipe in storage.list_recipes().await? {
                println!(
                    "{} {:?} steps={} total_ms={}",
                    recipe.id,
                    recipe.name,
                    recipe.steps.len(),
                    recipe.total_duration_ms()
                );
            }
        }
        Command::ImportRecipe { path } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let recipe: Recipe = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a recipe", path.display()))?;
            let storage = Storage::new(&cli.database_url).await?;
            let recipes = storage.save_recipe(recipe).await?;
            println!("stored; {} recipe(s) in database", recipes.len());
        }
        Command::ExportRecipe { recipe_id } => {
            let storage = Storage::new(&cli.database_url).await?;
            let recipe = storage
                .load_recipe(&recipe_id)
                .await?
                .with_context(|| format!("no recipe with id {recipe_id}"))?;
            println!("{}", serde_json::to_string_pretty(&recipe)?);
        }
        Command::DeleteRecipe { recipe_id } => {
            let storage = Storage::new(&cli.database_url).await?;
            let recipes = storage.delete_recipe(&recipe_id).await?;
            println!("deleted {recipe_id}; {} recipe(s) left", recipes.len());
        }
        Command::Calibrate { rpm, angle } => {
            let ms = calibration::ms_for_calibration(rpm, angle)?;
            println!("{ms}");
        }
        Command::NearestPwm { rpm } => {
            println!("{}", calibration::nearest_pwm_for_rpm(rpm));
        }
        Command::NearestRpm { pwm } => {
            println!("{}", calibration::nearest_rpm_for_pwm(pwm));
        }
    }

    Ok(())
}
