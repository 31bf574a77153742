//! A8RS - Atari 8-bit timing core in Rust
//!
//! ヘッドレス実行: メディアを判定・マウントし、指定フレーム数だけ回して結果を表示する。
//! 6502コアは外部コンポーネントなので、ここでは予算だけを消費する `IdleCore` を使う。
//!
//! # 使用方法
//! ```text
//! a8rs --os-rom atarixl.rom --frames 50 game.atr
//! a8rs --inspect image.xfd
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use a8rs::config::Config;
use a8rs::cpu::IdleCore;
use a8rs::media::{self, DiskImage, MediaKind};
use a8rs::patch_log::PatchLogLevel;
use a8rs::{Atari800, TvMode};

/// A8RS - Atari 8-bit timing core in Rust
#[derive(Parser, Debug)]
#[command(name = "a8rs")]
#[command(version = "0.1.0")]
#[command(about = "A8RS - Atari 8-bit timing, escape-patch and media core", long_about = None)]
struct Args {
    /// メディアファイル（ディスクは --drive から順に割り当てる）
    files: Vec<PathBuf>,

    /// テレビ方式 (pal, ntsc)。省略時は設定ファイルの値
    #[arg(long)]
    tv: Option<TvMode>,

    /// 実行するフレーム数
    #[arg(long, default_value = "50")]
    frames: u32,

    /// 最初のディスクを入れるドライブ (1-8)
    #[arg(long)]
    drive: Option<u8>,

    /// 書き込み禁止でマウント
    #[arg(long)]
    read_only: bool,

    /// マウント後にコールドスタートしない（ディスクとテープのみ）
    #[arg(long)]
    no_reboot: bool,

    /// OS ROM (10KB / 16KB)
    #[arg(long)]
    os_rom: Option<PathBuf>,

    /// BASIC ROM (8KB)
    #[arg(long)]
    basic_rom: Option<PathBuf>,

    /// 設定ファイル
    #[arg(long)]
    config: Option<PathBuf>,

    /// パッチログのカテゴリ (escape+sio+mount+timing, all)
    #[arg(long, default_value = "")]
    patch_log: String,

    /// 判定結果とジオメトリだけを表示して終了
    #[arg(long)]
    inspect: bool,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();

    // パッチログのカテゴリを設定
    match PatchLogLevel::parse(&args.patch_log) {
        Ok(level) => level.install(),
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if args.inspect {
        for path in &args.files {
            inspect(path);
        }
        return ExitCode::SUCCESS;
    }

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let mut options = config.core_options();
    if let Some(tv) = args.tv {
        options.tv_mode = tv;
    }

    println!("A8RS - Atari 8-bit core v0.1 ({:?})", options.tv_mode);
    let mut atari = Atari800::new(Box::new(IdleCore::new()), options);

    // ROMをロード（引数 → 設定ファイルの順）
    let os_rom = args.os_rom.clone().or_else(|| config.os_rom.as_deref().map(|name| config.rom_path(name)));
    match os_rom {
        Some(path) => match fs::read(&path) {
            Ok(data) => {
                if let Err(e) = atari.load_os_rom(&data) {
                    eprintln!("Failed to load OS ROM {}: {}", path.display(), e);
                }
            }
            Err(e) => eprintln!("Failed to read OS ROM {}: {}", path.display(), e),
        },
        None => eprintln!("Note: no OS ROM given, only the SIO patch is installed"),
    }

    let basic_rom = args.basic_rom.clone().or_else(|| config.basic_rom.as_deref().map(|name| config.rom_path(name)));
    if let Some(path) = basic_rom {
        match fs::read(&path) {
            Ok(data) => match atari.load_basic_rom(&data) {
                Ok(()) => atari.coldstart(),
                Err(e) => eprintln!("Failed to load BASIC ROM {}: {}", path.display(), e),
            },
            Err(e) => eprintln!("Failed to read BASIC ROM {}: {}", path.display(), e),
        }
    }

    // メディアをマウント
    let mut mount = config.mount_options();
    if let Some(drive) = args.drive {
        mount.drive = drive;
    }
    mount.read_only |= args.read_only;
    mount.reboot = !args.no_reboot;

    for path in &args.files {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("Failed to read {}: {}", path.display(), e);
                continue;
            }
        };
        match atari.open_file(&data, mount) {
            Ok(kind) => {
                println!("{}: {} (code {})", path.display(), kind, kind.code());
                if kind.is_disk() {
                    mount.drive = mount.drive.saturating_add(1);
                }
            }
            Err(e) => eprintln!("{}: {}", path.display(), e),
        }
    }

    run_headless(&mut atari, args.frames);

    match atari.exit() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.code() as u8)
        }
    }
}

fn run_headless(atari: &mut Atari800, frames: u32) {
    let start = Instant::now();
    let cycles_before = atari.clock().total_cycles();
    for _ in 0..frames {
        atari.frame();
    }
    let elapsed = start.elapsed();
    let cycles = atari.clock().total_cycles() - cycles_before;

    println!(
        "Executed {} frames ({} cycles) in {:?}",
        frames, cycles, elapsed
    );
    println!("Final PC: ${:04X}", atari.cpu().registers().pc);
    println!(
        "Escapes: {} installed, {} dispatched, {} unhandled",
        atari.escapes().len(),
        atari.escapes().dispatched_count(),
        atari.escapes().unhandled_count()
    );
    for diagnostic in atari.take_diagnostics() {
        println!("Diagnostic: {:?}", diagnostic);
    }
    let printed = atari.take_printer_output();
    if !printed.is_empty() {
        println!("Printer output:\n{}", printed);
    }
}

/// 判定結果を表示
fn inspect(path: &Path) {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path.display(), e);
            return;
        }
    };
    let descriptor = match media::classify(&data, None) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            println!("{}: {} (code 0)", path.display(), e);
            return;
        }
    };
    println!("{}: {} (code {})", path.display(), descriptor.kind, descriptor.kind.code());

    let image = match descriptor.kind {
        MediaKind::Atr => DiskImage::from_atr(&descriptor.payload).map(|(image, _)| image),
        MediaKind::Xfd => DiskImage::from_xfd(&descriptor.payload),
        MediaKind::Dcm => media::dcm::decode(&descriptor.payload),
        MediaKind::Xex => {
            match media::xex::parse_segments(&descriptor.payload) {
                Ok(segments) => {
                    for segment in segments {
                        println!("  segment ${:04X}-${:04X}", segment.start, segment.end());
                    }
                }
                Err(e) => println!("  {}", e),
            }
            return;
        }
        _ => return,
    };
    match image {
        Ok(image) => println!(
            "  {} sectors x {} bytes ({:?}, {:?} boot layout)",
            image.sector_count(),
            image.sector_size(),
            image.format(),
            image.boot_layout()
        ),
        Err(e) => println!("  {}", e),
    }
}
