//! Capability-based permission system.
//!
//! Every privileged kernel operation is gated by a 16-bit per-task
//! capability mask held in a fixed table indexed by task id. Task 0
//! (the kernel/idle task) holds everything. KERNEL_MODE short-circuits
//! all checks. Inheritance deliberately strips the administrative
//! bits — a child can never grant, revoke, or enter kernel mode just
//! because its parent could.

use bitflags::bitflags;

use crate::sched::MAX_TASKS;
use crate::sync::IrqMutex;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u16 {
        const MEMORY_ALLOC = 0x0001;
        const MEMORY_FREE  = 0x0002;
        const IO_READ      = 0x0004;
        const IO_WRITE     = 0x0008;
        const MSG_SEND     = 0x0010;
        const MSG_RECEIVE  = 0x0020;
        const IRQ_INSTALL  = 0x0040;
        const IRQ_REMOVE   = 0x0080;
        const TASK_CREATE  = 0x0100;
        const TASK_DESTROY = 0x0200;
        const PERM_GRANT   = 0x0400;
        const PERM_REVOKE  = 0x0800;
        const KERNEL_MODE  = 0x1000;
        const SHELL_ACCESS = 0x2000;
        const DEBUG        = 0x4000;
        const ADMIN        = 0x8000;
    }
}

/// Bits a child never inherits from its parent.
const NON_INHERITABLE: u16 = Capability::PERM_GRANT.bits()
    | Capability::PERM_REVOKE.bits()
    | Capability::KERNEL_MODE.bits();

#[derive(Debug, Clone, Copy)]
struct PermEntry {
    capabilities: u16,
    parent_id: u32,
    granted_time: u64,
    active: bool,
}

impl PermEntry {
    const fn empty() -> Self {
        Self {
            capabilities: 0,
            parent_id: 0,
            granted_time: 0,
            active: false,
        }
    }
}

#[derive(Clone)]
pub struct CapTable {
    entries: [PermEntry; MAX_TASKS],
    stamp: u64,
}

impl CapTable {
    pub const fn new() -> Self {
        let mut table = Self {
            entries: [PermEntry::empty(); MAX_TASKS],
            stamp: 0,
        };
        // Task 0 starts with every capability.
        table.entries[0] = PermEntry {
            capabilities: 0xFFFF,
            parent_id: 0,
            granted_time: 0,
            active: true,
        };
        table
    }

    /// Register a task with its initial capabilities. The parent must
    /// itself be allowed to create tasks, and the slot must be free.
    pub fn create(
        &mut self,
        task_id: usize,
        parent_id: usize,
        initial: u16,
    ) -> Result<(), &'static str> {
        if task_id >= MAX_TASKS || parent_id >= MAX_TASKS {
            return Err("task id out of range");
        }
        if !self.check(parent_id, Capability::TASK_CREATE) {
            return Err("parent lacks TASK_CREATE");
        }
        if self.entries[task_id].active {
            return Err("task slot already active");
        }

        self.stamp += 1;
        self.entries[task_id] = PermEntry {
            capabilities: initial,
            parent_id: parent_id as u32,
            granted_time: self.stamp,
            active: true,
        };
        self.inherit(task_id, parent_id);
        Ok(())
    }

    /// Deactivate a task. Task 0 is indestructible.
    pub fn destroy(&mut self, task_id: usize) {
        if task_id == 0 || task_id >= MAX_TASKS {
            return;
        }
        self.entries[task_id].active = false;
        self.entries[task_id].capabilities = 0;
    }

    /// OR capability bits into the target's mask.
    pub fn grant(
        &mut self,
        granter_id: usize,
        target_id: usize,
        bits: u16,
    ) -> Result<(), &'static str> {
        if granter_id >= MAX_TASKS || target_id >= MAX_TASKS {
            return Err("task id out of range");
        }
        if !self.check(granter_id, Capability::PERM_GRANT) {
            return Err("granter lacks PERM_GRANT");
        }
        if !self.entries[target_id].active {
            return Err("target task not active");
        }

        self.stamp += 1;
        self.entries[target_id].capabilities |= bits;
        self.entries[target_id].granted_time = self.stamp;
        Ok(())
    }

    /// Clear capability bits from the target's mask. Task 0 keeps its
    /// mask no matter who asks.
    pub fn revoke(
        &mut self,
        revoker_id: usize,
        target_id: usize,
        bits: u16,
    ) -> Result<(), &'static str> {
        if revoker_id >= MAX_TASKS || target_id >= MAX_TASKS {
            return Err("task id out of range");
        }
        if !self.check(revoker_id, Capability::PERM_REVOKE) {
            return Err("revoker lacks PERM_REVOKE");
        }
        if target_id == 0 {
            return Err("cannot revoke from task 0");
        }
        if !self.entries[target_id].active {
            return Err("target task not active");
        }

        self.stamp += 1;
        self.entries[target_id].capabilities &= !bits;
        self.entries[target_id].granted_time = self.stamp;
        Ok(())
    }

    /// KERNEL_MODE bypasses everything; otherwise all requested bits
    /// must be present.
    pub fn check(&self, task_id: usize, cap: Capability) -> bool {
        if task_id >= MAX_TASKS {
            return false;
        }
        let entry = &self.entries[task_id];
        if !entry.active {
            return false;
        }
        if entry.capabilities & Capability::KERNEL_MODE.bits() != 0 {
            return true;
        }
        entry.capabilities & cap.bits() == cap.bits()
    }

    pub fn get(&self, task_id: usize) -> u16 {
        if task_id >= MAX_TASKS || !self.entries[task_id].active {
            return 0;
        }
        self.entries[task_id].capabilities
    }

    pub fn is_active(&self, task_id: usize) -> bool {
        task_id < MAX_TASKS && self.entries[task_id].active
    }

    /// Copy the parent's capabilities into the child, minus the
    /// administrative bits.
    pub fn inherit(&mut self, child_id: usize, parent_id: usize) {
        if child_id >= MAX_TASKS || parent_id >= MAX_TASKS {
            return;
        }
        if !self.entries[parent_id].active {
            return;
        }
        let inheritable = self.entries[parent_id].capabilities & !NON_INHERITABLE;
        self.entries[child_id].capabilities |= inheritable;
    }
}

/// Human-readable name for a single capability bit.
pub fn capability_name(bit: u16) -> &'static str {
    match bit {
        0x0001 => "MEMORY_ALLOC",
        0x0002 => "MEMORY_FREE",
        0x0004 => "IO_READ",
        0x0008 => "IO_WRITE",
        0x0010 => "MSG_SEND",
        0x0020 => "MSG_RECEIVE",
        0x0040 => "IRQ_INSTALL",
        0x0080 => "IRQ_REMOVE",
        0x0100 => "TASK_CREATE",
        0x0200 => "TASK_DESTROY",
        0x0400 => "PERM_GRANT",
        0x0800 => "PERM_REVOKE",
        0x1000 => "KERNEL_MODE",
        0x2000 => "SHELL_ACCESS",
        0x4000 => "DEBUG",
        0x8000 => "ADMIN",
        _ => "UNKNOWN",
    }
}

static TABLE: IrqMutex<CapTable> = IrqMutex::new(CapTable::new());

pub fn init() {
    *TABLE.lock() = CapTable::new();
}

pub fn create(task_id: usize, parent_id: usize, initial: u16) -> Result<(), &'static str> {
    TABLE.lock().create(task_id, parent_id, initial)
}

pub fn destroy(task_id: usize) {
    TABLE.lock().destroy(task_id);
}

pub fn grant(granter_id: usize, target_id: usize, bits: u16) -> Result<(), &'static str> {
    TABLE.lock().grant(granter_id, target_id, bits)
}

pub fn revoke(revoker_id: usize, target_id: usize, bits: u16) -> Result<(), &'static str> {
    TABLE.lock().revoke(revoker_id, target_id, bits)
}

pub fn check(task_id: usize, cap: Capability) -> bool {
    TABLE.lock().check(task_id, cap)
}

pub fn get(task_id: usize) -> u16 {
    TABLE.lock().get(task_id)
}

pub fn is_active(task_id: usize) -> bool {
    TABLE.lock().is_active(task_id)
}

/// Copy of the whole table; lets subsystems consult activity and
/// capabilities without holding the table lock.
pub fn snapshot() -> CapTable {
    TABLE.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_user_task(task: usize, caps: u16) -> CapTable {
        let mut table = CapTable::new();
        table.create(task, 0, caps).unwrap();
        table
    }

    #[test]
    fn task_zero_has_everything() {
        let table = CapTable::new();
        assert!(table.check(0, Capability::ADMIN));
        assert!(table.check(0, Capability::MSG_SEND | Capability::MSG_RECEIVE));
        assert_eq!(table.get(0), 0xFFFF);
    }

    #[test]
    fn create_requires_task_create_on_parent() {
        let mut table = CapTable::new();
        table.create(1, 0, Capability::MSG_SEND.bits()).unwrap();
        // Task 1 has no TASK_CREATE, so it cannot spawn task 2.
        assert!(table.create(2, 1, 0).is_err());
        assert!(!table.is_active(2));

        // Occupied slots are rejected.
        assert!(table.create(1, 0, 0).is_err());
    }

    #[test]
    fn grant_without_permission_changes_nothing() {
        let mut table = table_with_user_task(1, Capability::MSG_SEND.bits());
        table.create(2, 0, 0).unwrap();
        let before = table.get(2);

        assert!(table.grant(1, 2, Capability::DEBUG.bits()).is_err());
        assert_eq!(table.get(2), before);

        // Task 0 can grant.
        table.grant(0, 2, Capability::DEBUG.bits()).unwrap();
        assert!(table.check(2, Capability::DEBUG));
    }

    #[test]
    fn revoke_rules() {
        let mut table = table_with_user_task(1, Capability::DEBUG.bits());
        // Task 0 cannot be stripped.
        assert!(table.revoke(0, 0, Capability::ADMIN.bits()).is_err());

        table.revoke(0, 1, Capability::DEBUG.bits()).unwrap();
        assert!(!table.check(1, Capability::DEBUG));
    }

    #[test]
    fn inherit_strips_administrative_bits() {
        let mut table = CapTable::new();
        // Parent with everything (task 0) spawns a child: the child
        // must not receive GRANT/REVOKE/KERNEL_MODE.
        table.create(1, 0, 0).unwrap();
        let caps = table.get(1);
        assert_eq!(caps & Capability::PERM_GRANT.bits(), 0);
        assert_eq!(caps & Capability::PERM_REVOKE.bits(), 0);
        assert_eq!(caps & Capability::KERNEL_MODE.bits(), 0);
        // Ordinary bits did come through.
        assert!(table.check(1, Capability::MSG_SEND));
    }

    #[test]
    fn kernel_mode_bypasses_checks() {
        let mut table = CapTable::new();
        table.create(1, 0, Capability::KERNEL_MODE.bits()).unwrap();
        assert!(table.check(1, Capability::ADMIN));
    }

    #[test]
    fn destroy_clears_but_spares_task_zero() {
        let mut table = table_with_user_task(1, 0xFF);
        table.destroy(1);
        assert!(!table.is_active(1));
        assert_eq!(table.get(1), 0);

        table.destroy(0);
        assert!(table.is_active(0));
    }
}
