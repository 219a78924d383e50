//! 进程管理
//!
//! PID 文件的写入与清理，以及以 root 启动后切换到低权限用户/组

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 进程级操作
pub struct ProcessManager;

impl ProcessManager {
    /// 写入当前进程的 PID，返回在 drop 时删除该文件的守卫
    pub fn write_pid_file(path: &Path) -> Result<PidFile> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create PID file directory: {parent:?}"))?;
        }

        let pid = std::process::id();
        let mut file = fs::File::create(path)
            .with_context(|| format!("Failed to create PID file: {path:?}"))?;
        writeln!(file, "{pid}").with_context(|| format!("Failed to write PID to file: {path:?}"))?;

        info!(path = ?path, pid, "PID file written");
        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }

    /// 切换到配置的用户/组；非 root 运行时只提示，不报错
    ///
    /// 必须在监听端口绑定完成之后调用。
    #[cfg(unix)]
    pub fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<()> {
        use nix::unistd::{Group, Uid, User, setgid, setuid};

        if user.is_none() && group.is_none() {
            return Ok(());
        }
        if !Uid::current().is_root() {
            warn!("Not running as root, cannot switch user/group");
            return Ok(());
        }

        // 先切组，setuid 之后就没有权限了
        if let Some(group_name) = group {
            let group_info = Group::from_name(group_name)?
                .ok_or_else(|| anyhow::anyhow!("Group '{group_name}' not found"))?;
            clear_supplementary_groups()?;
            setgid(group_info.gid)
                .with_context(|| format!("Failed to set group ID to {group_name}"))?;
            info!(group = group_name, gid = %group_info.gid, "Switched group");
        }

        if let Some(user_name) = user {
            let user_info = User::from_name(user_name)?
                .ok_or_else(|| anyhow::anyhow!("User '{user_name}' not found"))?;

            if group.is_none() {
                clear_supplementary_groups()?;
                setgid(user_info.gid)
                    .with_context(|| format!("Failed to set primary group for user {user_name}"))?;
            }

            setuid(user_info.uid)
                .with_context(|| format!("Failed to set user ID to {user_name}"))?;
            info!(user = user_name, uid = %user_info.uid, "Switched user");
        }

        Ok(())
    }

    #[cfg(not(unix))]
    pub fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<()> {
        if user.is_some() || group.is_some() {
            warn!("User/group switching is not supported on this platform");
        }
        Ok(())
    }
}

#[cfg(unix)]
fn clear_supplementary_groups() -> Result<()> {
    #[cfg(not(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "tvos",
        target_os = "watchos",
        target_os = "redox",
        target_os = "haiku"
    )))]
    nix::unistd::setgroups(&[]).context("Failed to clear supplementary groups")?;
    Ok(())
}

/// PID 文件守卫，drop 时删除文件
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = ?self.path, "PID file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?self.path, "Failed to remove PID file: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("portico.pid");

        let guard = ProcessManager::write_pid_file(&path).unwrap();
        let content = fs::read_to_string(guard.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_privileges_without_target_is_noop() {
        assert!(ProcessManager::drop_privileges(None, None).is_ok());
    }
}
