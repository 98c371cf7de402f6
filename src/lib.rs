// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Generational backup retention.
//!
//! Oxisafe keeps a bounded, time-bucketed history of copies for each file it
//! tracks. Every tracked file gets a fixed number of day, month, and year
//! slots. New copies enter the youngest day slot, and climb towards the year
//! slots as they age. Copies that no slot refers to anymore are deleted, so
//! a tracked file never holds more copies than there are slots.
//!
//! # See Also
//!
//! 1. [`SlotSchedule`]
//! 2. [`FileTable`]
//! 3. [`RetentionSafe`]

pub mod config;
pub mod path;
pub mod safe;
pub mod schedule;
pub mod table;

pub use config::{SafeConfig, SafeDirectory, ScheduleSettings};
pub use safe::{RetentionSafe, SafeError, SlotEntry};
pub use schedule::{ScheduleError, Slot, SlotSchedule};
pub use table::{FileTable, TableError};
