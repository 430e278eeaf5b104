//! 提权密钥
//!
//! 密钥只在一次 deploy 调用期间存在于 [`SecretSlot`] 中，由
//! [`SecretGuard`] 在任何退出路径上清除。

use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// 提权密钥，Debug 不输出内容，drop 时覆写内存
pub struct ElevatedSecret(String);

impl ElevatedSecret {
    pub fn new(secret: &str) -> Self {
        Self(secret.to_string())
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ElevatedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ElevatedSecret(***)")
    }
}

impl Drop for ElevatedSecret {
    fn drop(&mut self) {
        let len = self.0.len();
        self.0.replace_range(.., &"\0".repeat(len));
        self.0.clear();
    }
}

/// 实例级的密钥槽
#[derive(Default)]
pub struct SecretSlot {
    inner: Mutex<Option<ElevatedSecret>>,
}

impl SecretSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ElevatedSecret>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 写入密钥，返回的 guard 在 drop 时清除
    pub fn arm(&self, secret: Option<&str>) -> SecretGuard<'_> {
        *self.lock() = secret.map(ElevatedSecret::new);
        SecretGuard { slot: self }
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    /// sudo -S 需要的 stdin（密钥加换行）
    pub(crate) fn stdin_line(&self) -> Option<Vec<u8>> {
        self.lock().as_ref().map(|s| {
            let mut line = Vec::with_capacity(s.expose().len() + 1);
            line.extend_from_slice(s.expose().as_bytes());
            line.push(b'\n');
            line
        })
    }

    /// 从文本中抹去密钥
    pub(crate) fn redact(&self, text: &str) -> String {
        match self.lock().as_ref() {
            Some(s) if !s.expose().is_empty() && text.contains(s.expose()) => {
                text.replace(s.expose(), "***")
            }
            _ => text.to_string(),
        }
    }
}

/// 清除密钥的 guard
pub struct SecretGuard<'a> {
    slot: &'a SecretSlot,
}

impl Drop for SecretGuard<'_> {
    fn drop(&mut self) {
        self.slot.clear();
    }
}

/// 清零用过的 stdin 缓冲
pub(crate) fn wipe(buffer: &mut [u8]) {
    buffer.iter_mut().for_each(|b| *b = 0);
}
