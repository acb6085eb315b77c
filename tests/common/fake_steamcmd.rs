//! A POSIX shell stand-in for steamcmd
//!
//! Understands `+runscript <file>`, honors `force_install_dir` and writes
//! steamcmd-style output for every `workshop_download_item` line. Per-item
//! behavior is baked into the script when it is generated.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// How the fake tool treats one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Write a file and report success
    Ok,
    /// Report success without writing anything
    ClaimOnly,
    /// Report `Locking Failed` every time
    LockFailed,
    /// Report `Locking Failed` on the first attempt only
    LockFailedOnce,
    /// Report throttling on the first attempt only
    RateLimitedOnce,
    /// Hang until killed, on the first attempt only
    HangOnce,
    /// Hang until killed, every time
    HangAlways,
}

impl Mode {
    fn name(self) -> &'static str {
        match self {
            Mode::Ok => "ok",
            Mode::ClaimOnly => "claim",
            Mode::LockFailed => "lock",
            Mode::LockFailedOnce => "lock_once",
            Mode::RateLimitedOnce => "rate_once",
            Mode::HangOnce => "hang_once",
            Mode::HangAlways => "hang",
        }
    }
}

/// Builder for the fake tool script
#[derive(Debug, Default)]
pub struct FakeSteamCmd {
    modes: BTreeMap<String, Mode>,
}

impl FakeSteamCmd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, mode: Mode) -> Self {
        self.modes.insert(id.to_string(), mode);
        self
    }

    /// Write the executable into `dir/bin/steamcmd` and return its path
    pub fn install(&self, dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let bin = dir.join("bin");
        let state = dir.join("fake_state");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(&state).unwrap();

        let mut cases = String::new();
        for (id, mode) in &self.modes {
            writeln!(cases, "    {id}) echo {} ;;", mode.name()).unwrap();
        }

        let script = format!(
            r#"#!/bin/sh
state="{state}"
script="$2"
install=""

mode_for() {{
  case "$1" in
{cases}    *) echo ok ;;
  esac
}}

first_attempt() {{
  if [ -f "$state/$1.seen" ]; then
    return 1
  fi
  touch "$state/$1.seen"
  return 0
}}

download() {{
  dir="$install/steamapps/workshop/content/$1/$2"
  mkdir -p "$dir"
  echo "workshop item $2" > "$dir/item.bin"
  echo "Success. Downloaded item $2 to \"$dir\" (16 bytes)"
}}

echo "Steam Console Client (c) Valve Corporation - version 1712345"
echo "Loading Steam API...OK"
while IFS= read -r line || [ -n "$line" ]; do
  set -- $line
  case "$1" in
    force_install_dir)
      shift
      install="$*"
      ;;
    login)
      echo "Logging in user '$2' to Steam Public...OK"
      ;;
    workshop_download_item)
      app="$2"
      id="$3"
      echo "Downloading item $id ..."
      case "$(mode_for "$id")" in
        ok) download "$app" "$id" ;;
        claim) echo "Success. Downloaded item $id to \"$install\" (0 bytes)" ;;
        lock) echo "[AppID $app] Download item $id result : Locking Failed" ;;
        lock_once)
          if first_attempt "$id"; then
            echo "[AppID $app] Download item $id result : Locking Failed"
          else
            download "$app" "$id"
          fi
          ;;
        rate_once)
          if first_attempt "$id"; then
            echo "ERROR! Download item $id failed (Rate Limit Exceeded)"
          else
            download "$app" "$id"
          fi
          ;;
        hang_once)
          if first_attempt "$id"; then
            sleep 60
          else
            download "$app" "$id"
          fi
          ;;
        hang) sleep 60 ;;
      esac
      ;;
    quit)
      exit 0
      ;;
  esac
done < "$script"
"#,
            state = state.display(),
        );

        let path = bin.join("steamcmd");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
