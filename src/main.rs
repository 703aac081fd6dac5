use clap::{Parser, Subcommand};
use eyre::{bail, ensure, Context, Result};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::trace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use simfs::fs::check::Health;
use simfs::fs::inode::{Access, FileType};
use simfs::fs::session::Session;
use simfs::fs::{FileSystem, Geometry, InodeId};
use simfs::SimFs;

#[derive(Parser)]
struct Cli {
    /// Image file holding the volume
    #[arg(long, env = "SIMFS_IMAGE", default_value = "simulated_disk.img")]
    image: PathBuf,
    /// Working directory to resolve relative paths from
    #[arg(long, default_value = "/")]
    cwd: String,
    /// User id the command runs as
    #[arg(long, default_value_t = 0)]
    uid: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replace the image with an empty volume
    Format {
        #[arg(short = 'c', long = "blocks", default_value_t = Geometry::DEFAULT_BLOCK_COUNT)]
        block_count: u32,
        #[arg(short = 'i', long = "inodes", default_value_t = Geometry::DEFAULT_INODE_COUNT)]
        inode_count: u32,
        #[arg(short = 'b', long, default_value_t = Geometry::DEFAULT_BLOCK_SIZE)]
        block_size: u32,
    },
    Ls {
        #[arg(index = 1, default_value = ".")]
        path: String,
    },
    Tree {
        #[arg(index = 1, default_value = ".")]
        path: String,
    },
    Mkdir {
        #[arg(index = 1)]
        path: String,
    },
    Touch {
        #[arg(index = 1)]
        path: String,
    },
    /// Write DATA (or stdin) into a file, creating it if needed
    Write {
        #[arg(index = 1)]
        path: String,
        #[arg(index = 2)]
        data: Option<String>,
        #[arg(short = 'o', long, default_value_t = 0)]
        offset: u64,
        #[arg(short = 'a', long, conflicts_with = "offset")]
        append: bool,
    },
    Cat {
        #[arg(index = 1)]
        path: String,
    },
    Truncate {
        #[arg(index = 1)]
        path: String,
        #[arg(index = 2)]
        size: u64,
    },
    Rm {
        #[arg(index = 1)]
        path: String,
        #[arg(short = 'r', long)]
        recursive: bool,
    },
    /// Give the file TARGET another name, or point a symbolic link at it
    Ln {
        #[arg(index = 1)]
        target: String,
        #[arg(index = 2)]
        link: String,
        #[arg(short = 's', long)]
        symbolic: bool,
    },
    Cp {
        #[arg(index = 1)]
        from: String,
        #[arg(index = 2)]
        to: String,
    },
    Mv {
        #[arg(index = 1)]
        from: String,
        #[arg(index = 2)]
        to: String,
    },
    Stat {
        #[arg(index = 1)]
        path: String,
    },
    Pwd,
    Df,
    Fsck,
}

impl Command {
    fn mutates(&self) -> bool {
        matches!(
            self,
            Command::Format { .. }
                | Command::Mkdir { .. }
                | Command::Touch { .. }
                | Command::Write { .. }
                | Command::Truncate { .. }
                | Command::Rm { .. }
                | Command::Ln { .. }
                | Command::Cp { .. }
                | Command::Mv { .. }
        )
    }
}

/// A read-only command never replaces an image that failed to load.
fn needs_save(command: &Command, disk: &SimFs) -> bool {
    command.mutates() || (disk.is_fresh() && !disk.discarded_image())
}

fn kind_char(kind: FileType) -> char {
    match kind {
        FileType::Directory => 'd',
        FileType::File => '-',
        FileType::Symlink => 'l',
    }
}

fn mode_string(kind: FileType, permissions: u16) -> String {
    let mut out = String::with_capacity(10);
    out.push(kind_char(kind));
    for shift in [6, 3, 0] {
        let bits = (permissions >> shift) & 0b111;
        out.push(if bits & 0b100 != 0 { 'r' } else { '-' });
        out.push(if bits & 0b010 != 0 { 'w' } else { '-' });
        out.push(if bits & 0b001 != 0 { 'x' } else { '-' });
    }
    out
}

fn print_tree(fs: &FileSystem, dir: InodeId, depth: usize) -> Result<()> {
    for (entry, inode) in fs.list_directory(dir)? {
        if entry.is_dot() {
            continue;
        }
        let marker = match inode.kind {
            FileType::Directory => "/".to_string(),
            FileType::Symlink => format!(" -> {}", fs.read_link(entry.inode)?),
            FileType::File => String::new(),
        };
        println!("{}{}{marker}", "  ".repeat(depth), entry.name);
        if inode.is_dir() {
            print_tree(fs, entry.inode, depth + 1)?;
        }
    }
    Ok(())
}

fn read_input(data: Option<String>) -> Result<Vec<u8>> {
    match data {
        Some(data) => Ok(data.into_bytes()),
        None => {
            let mut buffer = Vec::new();
            std::io::stdin().read_to_end(&mut buffer)?;
            Ok(buffer)
        }
    }
}

fn run(disk: &mut SimFs, mut session: Session, cwd: &str, command: Command) -> Result<()> {
    let fs = disk.volume_mut();
    session
        .chdir(fs, cwd)
        .wrap_err_with(|| format!("Cannot change into {cwd:?}"))?;
    let uid = session.uid();
    match command {
        Command::Format { .. } => {}
        Command::Ls { path } => {
            let dir = session.resolve_follow(fs, &path)?;
            session.ensure_access(fs, dir, Access::Read)?;
            for (entry, inode) in fs.list_directory(dir)? {
                let target = match inode.kind {
                    FileType::Symlink => format!(" -> {}", fs.read_link(entry.inode)?),
                    _ => String::new(),
                };
                println!(
                    "{} {:>3} {:>5} {:>8} {:>5} {}{target}",
                    mode_string(inode.kind, inode.permissions),
                    inode.link_count,
                    inode.owner,
                    inode.size,
                    entry.inode,
                    entry.name
                );
            }
        }
        Command::Tree { path } => {
            let dir = session.resolve_follow(fs, &path)?;
            println!("{}", fs.path_of(dir)?);
            print_tree(fs, dir, 1)?;
        }
        Command::Mkdir { path } => {
            let (parent, name) = session.resolve_parent(fs, &path)?;
            session.ensure_access(fs, parent, Access::Write)?;
            fs.make_directory(parent, name, <FileSystem>::DIRECTORY_PERMISSIONS, uid)?;
        }
        Command::Touch { path } => {
            if session.resolve_follow(fs, &path).is_err() {
                let (parent, name) = session.resolve_parent(fs, &path)?;
                session.ensure_access(fs, parent, Access::Write)?;
                fs.create_file(parent, name, <FileSystem>::FILE_PERMISSIONS, uid)?;
            }
        }
        Command::Write {
            path,
            data,
            offset,
            append,
        } => {
            let file = match session.resolve_follow(fs, &path) {
                Ok(file) => file,
                Err(_) => {
                    let (parent, name) = session.resolve_parent(fs, &path)?;
                    session.ensure_access(fs, parent, Access::Write)?;
                    fs.create_file(parent, name, <FileSystem>::FILE_PERMISSIONS, uid)?
                }
            };
            session.ensure_access(fs, file, Access::Write)?;
            let offset = if append { fs.stat(file)?.size } else { offset };
            let data = read_input(data)?;
            let written = fs.write(file, offset, &data)?;
            trace!("Wrote {written} bytes to {path:?}");
        }
        Command::Cat { path } => {
            let file = session.resolve_follow(fs, &path)?;
            session.ensure_access(fs, file, Access::Read)?;
            let data = fs.read_all(file)?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Truncate { path, size } => {
            let file = session.resolve_follow(fs, &path)?;
            session.ensure_access(fs, file, Access::Write)?;
            fs.truncate(file, size)?;
        }
        Command::Rm { path, recursive } => {
            let (parent, name) = session.resolve_parent(fs, &path)?;
            session.ensure_access(fs, parent, Access::Write)?;
            let target = fs.find_entry(parent, name)?;
            if fs.stat(target)?.is_dir() {
                ensure!(recursive, "{path:?} is a directory, use -r");
                fs.remove_directory(parent, name, true)?;
            } else {
                fs.remove_file(parent, name)?;
            }
        }
        Command::Ln {
            target,
            link,
            symbolic,
        } => {
            let (parent, name) = session.resolve_parent(fs, &link)?;
            session.ensure_access(fs, parent, Access::Write)?;
            if symbolic {
                fs.create_symlink(parent, name, &target, uid)?;
            } else {
                let file = session.resolve(fs, &target)?;
                fs.hard_link(file, parent, name)?;
            }
        }
        Command::Cp { from, to } => {
            let source = session.resolve_follow(fs, &from)?;
            session.ensure_access(fs, source, Access::Read)?;
            let (parent, name) = match session.resolve_follow(fs, &to) {
                Ok(dir) if fs.stat(dir)?.is_dir() => {
                    let (_, name) = simfs::fs::path::split_parent(&from);
                    (dir, name)
                }
                Ok(_) => bail!("{to:?} already exists"),
                Err(_) => session.resolve_parent(fs, &to)?,
            };
            session.ensure_access(fs, parent, Access::Write)?;
            fs.copy_file(source, parent, name, uid)?;
        }
        Command::Mv { from, to } => {
            let (parent, name) = session.resolve_parent(fs, &from)?;
            session.ensure_access(fs, parent, Access::Write)?;
            let (new_parent, new_name) = match session.resolve(fs, &to) {
                Ok(dir) if fs.stat(dir)?.is_dir() => (dir, name),
                Ok(_) => bail!("{to:?} already exists"),
                Err(_) => session.resolve_parent(fs, &to)?,
            };
            session.ensure_access(fs, new_parent, Access::Write)?;
            fs.rename(parent, name, new_parent, new_name)?;
        }
        Command::Stat { path } => {
            let id = session.resolve(fs, &path)?;
            let inode = fs.stat(id)?;
            if inode.is_symlink() {
                println!("  Link: {}", fs.read_link(id)?);
            }
            let path = fs.path_of(id).unwrap_or_else(|err| format!("<{err}>"));
            println!("  Path: {path}");
            println!(" Inode: {}  Type: {:?}", inode.id, inode.kind);
            println!("  Size: {}  Blocks: {:?}", inode.size, inode.blocks);
            println!(
                "Access: {} ({:o})  Owner: {}",
                mode_string(inode.kind, inode.permissions),
                inode.permissions,
                inode.owner
            );
            println!(" Links: {}", inode.link_count);
            println!(
                " atime: {}  mtime: {}  ctime: {}",
                inode.atime, inode.mtime, inode.ctime
            );
        }
        Command::Pwd => println!("{}", session.pwd(fs)?),
        Command::Df => {
            let usage = fs.usage();
            for (label, resource) in [("blocks", usage.blocks), ("inodes", usage.inodes)] {
                let health = match resource.health() {
                    Health::Healthy => "healthy",
                    Health::Warning => "warning",
                    Health::Critical => "critical",
                };
                println!(
                    "{label:<7} {:>8} total {:>8} used {:>8} free {:>5.1}% {health}",
                    resource.total,
                    resource.used(),
                    resource.free,
                    resource.percent()
                );
            }
            println!("block size {} bytes", usage.block_size);
        }
        Command::Fsck => {
            let problems = fs.check();
            if problems.is_empty() {
                println!("volume is consistent");
            } else {
                for problem in &problems {
                    println!("{problem}");
                }
                bail!("{} inconsistencies found", problems.len());
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
    trace!("Starting up simfs cli");
    let mut disk = match cli.command {
        Command::Format {
            block_count,
            inode_count,
            block_size,
        } => SimFs::format(
            &cli.image,
            Geometry {
                block_count,
                inode_count,
                block_size,
            },
        )?,
        _ => SimFs::open_or_format(&cli.image, Geometry::default())?,
    };
    if disk.discarded_image() {
        eprintln!("{:?} could not be loaded, using an empty volume", disk.path());
    } else if disk.is_fresh() {
        eprintln!("formatted a new volume at {:?}", disk.path());
    }
    let session = Session::at_root(disk.volume(), cli.uid);
    let save = needs_save(&cli.command, &disk);
    run(&mut disk, session, &cli.cwd, cli.command)?;
    if save {
        disk.save().wrap_err("Failed to save volume")?;
    }
    Ok(())
}

#[test]
fn test_read_only_commands_keep_unreadable_images() {
    let path = std::env::temp_dir().join(format!("simfs-cli-{}.img", std::process::id()));
    let ls = Command::Ls {
        path: ".".to_string(),
    };
    let mkdir = Command::Mkdir {
        path: "d".to_string(),
    };
    let _ = std::fs::remove_file(&path);
    let missing = SimFs::open_or_format(&path, Geometry::default()).unwrap();
    assert!(needs_save(&ls, &missing));

    std::fs::write(&path, b"not an image").unwrap();
    let unreadable = SimFs::open_or_format(&path, Geometry::default()).unwrap();
    assert!(!needs_save(&ls, &unreadable));
    assert!(needs_save(&mkdir, &unreadable));
    std::fs::remove_file(&path).unwrap();
}
