mod logging;
mod shell;

use std::{
    io::{self, BufRead, IsTerminal, Write},
    path::PathBuf,
    sync::Arc,
};

use easy_vfs::{FsConfig, HostImage, ImageDevice, MemoryImage, VirtualFs, BLOCK_COUNT, BLOCK_SZ};
use structopt::StructOpt;

use shell::Shell;

#[derive(Debug, StructOpt)]
#[structopt(name = "easy-vfs-shell", about = "Shell over a simulated block file system")]
struct Opt {
    #[structopt(
        short,
        long,
        default_value = "vfs.img",
        help = "Image file on the host",
        parse(from_os_str)
    )]
    image: PathBuf,
    #[structopt(long, default_value = "32", help = "Block size used when formatting")]
    block_size: usize,
    #[structopt(long, default_value = "256", help = "Block count used when formatting")]
    blocks: usize,
    #[structopt(long, help = "Keep the image in memory only")]
    ephemeral: bool,
    #[structopt(long, help = "Log level: error, warn, info, debug or trace")]
    log: Option<String>,
    #[structopt(short, long = "command", help = "Run these commands and leave")]
    commands: Vec<String>,
}

fn run() -> easy_vfs::Result<()> {
    let opt = Opt::from_args();
    logging::init(opt.log.as_deref());
    log::debug!("easy-vfs-shell: {opt:?}");

    let device: Arc<dyn ImageDevice> = if opt.ephemeral {
        Arc::new(MemoryImage::new())
    } else {
        let host = HostImage::new(&opt.image);
        log::info!("image file: {}", host.path().display());
        Arc::new(host)
    };
    let config = FsConfig {
        block_size: opt.block_size,
        block_count: opt.blocks,
    };
    if config != FsConfig::default() {
        log::info!(
            "custom geometry {}B x {} (default {}B x {})",
            config.block_size,
            config.block_count,
            BLOCK_SZ,
            BLOCK_COUNT
        );
    }
    let mut shell = Shell::new(VirtualFs::mount(device, config)?);

    if !opt.commands.is_empty() {
        for line in &opt.commands {
            if let Some(out) = shell.exec(line) {
                println!("{out}");
            }
            if shell.exited() {
                break;
            }
        }
        return shell.close();
    }

    let stdin = io::stdin();
    let interactive = stdin.is_terminal();
    if interactive {
        println!("easy-vfs shell. Type 'help' for commands.");
    }
    let mut lines = stdin.lock().lines();
    loop {
        if interactive {
            print!("{}", shell.prompt());
            io::stdout().flush()?;
        }
        let Some(line) = lines.next() else {
            break;
        };
        if let Some(out) = shell.exec(&line?) {
            println!("{out}");
        }
        if shell.exited() {
            break;
        }
    }
    shell.close()
}

fn main() {
    if let Err(e) = run() {
        eprintln!("easy-vfs-shell: {e}");
        std::process::exit(1);
    }
}
