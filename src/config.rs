// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for the configuration file that Oxisafe uses to simplify
//! the process of serialization and deserialization. File I/O is left to the
//! caller to figure out.

use crate::{
    path::default_safe_dir,
    schedule::{ScheduleError, SlotSchedule},
};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Safe configuration layout.
///
/// Names the directory a safe lives in, and the shape of the retention
/// ladder every tracked file climbs in that safe.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SafeConfig {
    /// Directory holding table files and stored copies.
    #[serde(default)]
    pub directory: SafeDirectory,

    /// Retention ladder of the safe.
    #[serde(default)]
    pub schedule: ScheduleSettings,
}

impl FromStr for SafeConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: SafeConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on safe directory field.
        config.directory = SafeDirectory::new(
            shellexpand::full(config.directory.to_string().as_str())
                .map_err(ConfigError::ShellExpansion)?
                .into_owned(),
        );

        Ok(config)
    }
}

impl Display for SafeConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Retention ladder settings.
///
/// Counts left out of the configuration take their default value.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Number of day slots.
    pub days: u32,

    /// Number of month slots.
    pub months: u32,

    /// Number of year slots.
    pub years: u32,
}

impl ScheduleSettings {
    /// Build slot schedule out of settings.
    ///
    /// # Errors
    ///
    /// - Return [`ScheduleError`] if settings describe an invalid ladder.
    pub fn build(&self) -> Result<SlotSchedule, ScheduleError> {
        SlotSchedule::new(self.days, self.months, self.years)
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            days: 7,
            months: 11,
            years: 3,
        }
    }
}

/// Path acting as the safe directory.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SafeDirectory(PathBuf);

impl SafeDirectory {
    /// Construct new safe directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Treat safe directory as [`Path`] slice.
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Default for SafeDirectory {
    fn default() -> Self {
        Self(default_safe_dir().unwrap_or_else(|_| PathBuf::from("oxisafe-store")))
    }
}

impl Display for SafeDirectory {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_path().to_string_lossy().as_ref())
    }
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("BLAH", "/home/blah")])]
    fn deserialize_safe_config() -> anyhow::Result<()> {
        let result: SafeConfig = r#"
            directory = "$BLAH/backups"

            [schedule]
            days = 4
            months = 3
            years = 3
        "#
        .parse()?;

        let expect = SafeConfig {
            directory: SafeDirectory::new("/home/blah/backups"),
            schedule: ScheduleSettings {
                days: 4,
                months: 3,
                years: 3,
            },
        };

        assert_eq!(result, expect);
        assert_eq!(result.schedule.build()?.len(), 10);

        Ok(())
    }

    #[test]
    fn deserialize_partial_safe_config() -> anyhow::Result<()> {
        let result: SafeConfig = r#"directory = "/srv/safe""#.parse()?;
        assert_eq!(result.directory, SafeDirectory::new("/srv/safe"));
        assert_eq!(result.schedule, ScheduleSettings::default());

        Ok(())
    }

    #[test]
    fn deserialize_partial_schedule_settings() -> anyhow::Result<()> {
        let result: SafeConfig = indoc! {r#"
            [schedule]
            days = 5
        "#}
        .parse()?;

        let expect = ScheduleSettings {
            days: 5,
            ..ScheduleSettings::default()
        };
        assert_eq!(result.schedule, expect);

        Ok(())
    }

    #[test]
    fn deserialize_rejects_negative_counts() {
        let result = indoc! {r#"
            [schedule]
            days = -1
            months = 3
            years = 3
        "#}
        .parse::<SafeConfig>();
        assert!(matches!(result, Err(ConfigError::Deserialize(_))));
    }

    #[test]
    fn serialize_safe_config() {
        let result = SafeConfig {
            directory: SafeDirectory::new("/home/blah/backups"),
            schedule: ScheduleSettings {
                days: 4,
                months: 3,
                years: 3,
            },
        }
        .to_string();

        let expect = indoc! {r#"
            directory = "/home/blah/backups"

            [schedule]
            days = 4
            months = 3
            years = 3
        "#};

        assert_eq!(result, expect);
    }

    #[test]
    fn default_schedule_is_valid() {
        assert!(ScheduleSettings::default().build().is_ok());
    }
}
