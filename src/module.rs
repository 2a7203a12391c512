//! Module lifecycle.
//!
//! Every hardware driver and logic module implements [`Module`]. The host calls
//! `on_activate` once the module's connections are in place and
//! `on_deactivate` before tearing it down. Between the two the module is
//! `Idle`, or `Locked` while a long-running measurement owns it.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Not activated, or deactivated again.
    Deactivated,
    /// Activated and free.
    Idle,
    /// Activated and running a measurement.
    Locked,
}

/// Base trait for all hardware and logic modules.
#[async_trait]
pub trait Module: Send + Sync {
    /// Instance name as given in the configuration.
    fn name(&self) -> &str;

    /// Open devices, send init commands, start background loops.
    async fn on_activate(&self) -> Result<()>;

    /// Stop background loops, shut devices down and release them.
    async fn on_deactivate(&self) -> Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> ModuleState;
}

/// Lock-free holder for a [`ModuleState`], shared by module implementations.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// New cell in `Deactivated`.
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Read the state.
    pub fn get(&self) -> ModuleState {
        match self.0.load(Ordering::SeqCst) {
            0 => ModuleState::Deactivated,
            1 => ModuleState::Idle,
            _ => ModuleState::Locked,
        }
    }

    /// Overwrite the state.
    pub fn set(&self, state: ModuleState) {
        self.0.store(encode(state), Ordering::SeqCst);
    }

    /// Move `Idle -> Locked`. Returns false if the module was not idle.
    pub fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(
                encode(ModuleState::Idle),
                encode(ModuleState::Locked),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move `Locked -> Idle`. A deactivated module stays deactivated.
    pub fn unlock(&self) {
        let _ = self.0.compare_exchange(
            encode(ModuleState::Locked),
            encode(ModuleState::Idle),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(state: ModuleState) -> u8 {
    match state {
        ModuleState::Deactivated => 0,
        ModuleState::Idle => 1,
        ModuleState::Locked => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_only_from_idle() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ModuleState::Deactivated);
        assert!(!cell.try_lock());

        cell.set(ModuleState::Idle);
        assert!(cell.try_lock());
        assert_eq!(cell.get(), ModuleState::Locked);
        assert!(!cell.try_lock());

        cell.unlock();
        assert_eq!(cell.get(), ModuleState::Idle);
    }

    #[test]
    fn unlock_keeps_deactivated() {
        let cell = StateCell::new();
        cell.unlock();
        assert_eq!(cell.get(), ModuleState::Deactivated);
    }
}
