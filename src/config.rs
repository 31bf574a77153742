//! 設定ファイル管理モジュール
//!
//! コアの設定をJSON形式で永続化

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::atari::CoreOptions;
use crate::clock::TvMode;
use crate::error::ConfigError;
use crate::media::MountOptions;

/// 設定ファイル名（インストール先に置く）
const CONFIG_FILENAME: &str = "a8rs_config.json";

/// a8rs のインストール先（実行ファイルのあるディレクトリ）
///
/// 実行ファイルの場所が分からなければ空パス（カレントディレクトリ扱い）。
pub fn install_dir() -> PathBuf {
    match std::env::current_exe() {
        Ok(exe) => exe.parent().map(Path::to_path_buf).unwrap_or_default(),
        Err(e) => {
            log::debug!("Executable path unavailable ({}), using the working directory", e);
            PathBuf::new()
        }
    }
}

/// ROM・メディアの基準ディレクトリ。空または相対ならインストール先から数える
pub fn home_dir(home: &str) -> PathBuf {
    let home = Path::new(home);
    if home.is_absolute() {
        home.to_path_buf()
    } else {
        install_dir().join(home)
    }
}

/// 既定の設定ファイル
pub fn config_file() -> PathBuf {
    install_dir().join(CONFIG_FILENAME)
}

/// コア設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// ホームディレクトリ（相対パスの基準）
    /// 空の場合は実行ファイルのディレクトリを使用
    #[serde(default)]
    pub home: String,
    /// テレビ方式
    #[serde(default)]
    pub tv_mode: TvMode,
    /// OS ROMのパス
    pub os_rom: Option<String>,
    /// BASIC ROMのパス
    pub basic_rom: Option<String>,
    /// BASICを有効にして起動
    #[serde(default)]
    pub basic_enabled: bool,
    /// SIOパッチ（高速ディスクI/O）
    #[serde(default = "default_true")]
    pub sio_patch: bool,
    /// プリンタ (P:) パッチ
    #[serde(default = "default_true")]
    pub printer_patch: bool,
    /// 既定のドライブ (1-8)
    #[serde(default = "default_drive")]
    pub default_drive: u8,
    /// 既定で書き込み禁止でマウント
    #[serde(default)]
    pub read_only: bool,
    /// 最後に開いたメディア
    pub last_media: Option<String>,
    /// ROMディレクトリ
    #[serde(default = "default_rom_dir")]
    pub rom_dir: String,
    /// メディアディレクトリ
    #[serde(default = "default_media_dir")]
    pub media_dir: String,
}

fn default_true() -> bool { true }
fn default_drive() -> u8 { 1 }
fn default_rom_dir() -> String { "roms".to_string() }
fn default_media_dir() -> String { "media".to_string() }

impl Default for Config {
    fn default() -> Self {
        Config {
            home: String::new(),
            tv_mode: TvMode::default(),
            os_rom: None,
            basic_rom: None,
            basic_enabled: false,
            sio_patch: true,
            printer_patch: true,
            default_drive: default_drive(),
            read_only: false,
            last_media: None,
            rom_dir: default_rom_dir(),
            media_dir: default_media_dir(),
        }
    }
}

impl Config {
    /// 設定ファイルを読み込む（実行ファイルと同じディレクトリから）
    pub fn load() -> Self {
        Self::load_from(config_file())
    }

    /// 指定したパスから設定を読み込む
    /// ファイルがなければ既定値、壊れていれば警告して既定値
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        if !path.as_ref().exists() {
            return Config::default();
        }
        match Self::try_load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to load config {:?}: {}, using defaults", path.as_ref(), e);
                Config::default()
            }
        }
    }

    pub fn try_load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// 設定ファイルを保存する（実行ファイルと同じディレクトリに）
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(config_file())
    }

    /// 指定したパスに設定を保存する
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// 相対パスをホームからの絶対パスに解決
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        home_dir(&self.home).join(path)
    }

    /// ROMディレクトリの絶対パスを取得
    pub fn rom_dir_path(&self) -> PathBuf {
        self.resolve_path(&self.rom_dir)
    }

    /// メディアディレクトリの絶対パスを取得
    pub fn media_dir_path(&self) -> PathBuf {
        self.resolve_path(&self.media_dir)
    }

    /// ROMのパス（ファイル名だけならROMディレクトリから）
    pub fn rom_path(&self, name: &str) -> PathBuf {
        if Path::new(name).components().count() > 1 {
            self.resolve_path(name)
        } else {
            self.rom_dir_path().join(name)
        }
    }

    /// コアの起動オプション
    pub fn core_options(&self) -> CoreOptions {
        CoreOptions {
            tv_mode: self.tv_mode,
            sio_patch: self.sio_patch,
            printer_patch: self.printer_patch,
            basic_enabled: self.basic_enabled,
        }
    }

    /// 既定のマウントオプション
    pub fn mount_options(&self) -> MountOptions {
        MountOptions {
            drive: self.default_drive,
            read_only: self.read_only,
            reboot: true,
        }
    }
}
