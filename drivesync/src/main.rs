use std::path::PathBuf;

use drivesync::app::App;
use drivesync::config::SyncConfig;
use drivesync::logging::{self, LogSettings};
use tracing::info;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct CliArgs {
    authenticate: bool,
    list_local: bool,
    test_remote_ops: bool,
    sync: bool,
    dry_run: bool,
    verify: bool,
    help: bool,
    source_folder: Option<PathBuf>,
    target_folder_id: Option<String>,
}

impl CliArgs {
    fn has_action(&self) -> bool {
        self.authenticate || self.list_local || self.test_remote_ops || self.sync || self.verify
    }
}

fn parse_cli_args<I>(args: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--authenticate" => parsed.authenticate = true,
            "--list-local" => parsed.list_local = true,
            "--test-remote-ops" => parsed.test_remote_ops = true,
            "--sync" => parsed.sync = true,
            "--dry-run" => parsed.dry_run = true,
            "--verify" => parsed.verify = true,
            "--source-folder" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--source-folder requires a path"))?;
                parsed.source_folder = Some(PathBuf::from(value));
            }
            "--target-folder-id" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--target-folder-id requires an id"))?;
                parsed.target_folder_id = Some(value);
            }
            "--help" | "-h" => parsed.help = true,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    if parsed.dry_run && !parsed.sync {
        anyhow::bail!("--dry-run only applies to --sync");
    }
    Ok(parsed)
}

fn print_usage() {
    println!("Usage: drivesync [ACTIONS] [OPTIONS]");
    println!();
    println!("Actions (run in this order when combined):");
    println!("  --authenticate          Refresh and store OAuth credentials");
    println!("  --list-local            List entries under the source folder");
    println!("  --test-remote-ops       Create a test folder and list the remote root");
    println!("  --sync                  Mirror the source folder to the target folder");
    println!("  --verify                Compare local files with recorded uploads");
    println!();
    println!("Options:");
    println!("  --dry-run               With --sync, log actions without performing them");
    println!("  --source-folder <PATH>  Override DRIVESYNC_SOURCE_FOLDER");
    println!("  --target-folder-id <ID> Override DRIVESYNC_TARGET_FOLDER_ID");
    println!("  -h, --help              Show this help");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = parse_cli_args(std::env::args())?;
    if args.help || !args.has_action() {
        print_usage();
        return Ok(());
    }

    logging::init(&LogSettings::from_env())?;
    let config = SyncConfig::from_env()?
        .with_overrides(args.source_folder.clone(), args.target_folder_id.clone());
    let app = App::new(config);
    info!(
        source = ?app.config().source_folder,
        target = %app.config().target_folder_id,
        "drivesync starting"
    );

    if args.authenticate {
        app.authenticate().await?;
    }
    if args.list_local {
        app.list_local()?;
    }
    if args.test_remote_ops {
        app.test_remote_ops().await?;
    }
    if args.sync {
        app.sync(args.dry_run).await?;
    }
    if args.verify {
        app.verify().await?;
    }
    Ok(())
}
