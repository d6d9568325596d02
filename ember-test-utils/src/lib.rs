//! Ember Test Utilities
//!
//! Shared test infrastructure for the ember workspace:
//! - Proptest generators for keys, enums and timestamps
//! - Fixtures for isolated data roots and a scripted archive tool
//! - Assertions over `EmberResult`

pub use ember_core::{
    ArchiveError, EmberError, EmberResult, GroupStatus, InvitationStatus, Permission,
    PersistenceConfig, StorageError, Timestamp, UserStatus, ValidationError, WritePolicy,
};

use chrono::{TimeZone, Utc};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for ember types.

    use super::*;
    use proptest::prelude::*;

    /// Numeric platform id, as users and groups are keyed.
    pub fn arb_entity_id() -> impl Strategy<Value = String> {
        (10_000u64..10_000_000_000u64).prop_map(|id| id.to_string())
    }

    /// Display names, including the empty string and non-ASCII text.
    pub fn arb_display_name() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            "[a-zA-Z0-9 _-]{1,24}",
            "\\PC{1,12}",
        ]
    }

    /// Timestamps between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_577_836_800i64..1_893_456_000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_permission() -> impl Strategy<Value = Permission> {
        (0u8..16).prop_map(Permission::from_bits_truncate)
    }

    pub fn arb_group_status() -> impl Strategy<Value = GroupStatus> {
        prop_oneof![
            Just(GroupStatus::Authorized),
            Just(GroupStatus::Banned),
            Just(GroupStatus::Left),
            Just(GroupStatus::Unauthorized),
        ]
    }

    pub fn arb_user_status() -> impl Strategy<Value = UserStatus> {
        prop_oneof![Just(UserStatus::Normal), Just(UserStatus::Banned)]
    }

    pub fn arb_invitation_status() -> impl Strategy<Value = InvitationStatus> {
        prop_oneof![
            Just(InvitationStatus::Pending),
            Just(InvitationStatus::Approved),
            Just(InvitationStatus::Rejected),
            Just(InvitationStatus::Ignored),
        ]
    }

    pub fn arb_write_policy() -> impl Strategy<Value = WritePolicy> {
        prop_oneof![Just(WritePolicy::Deferred), Just(WritePolicy::Immediate)]
    }

    pub fn arb_plugin_name() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{2,15}"
    }

    /// `(start, end)` with `start <= end`, both between 2020 and 2030.
    pub fn arb_time_range() -> impl Strategy<Value = (Timestamp, Timestamp)> {
        (arb_timestamp(), arb_timestamp())
            .prop_map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for storage tests.

    use super::*;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    /// Noon UTC on the given day.
    pub fn ts(year: i32, month: u32, day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Config rooted in `root` with a short flush interval.
    pub fn test_config(root: &Path) -> PersistenceConfig {
        PersistenceConfig::default()
            .with_data_root(root.join("db"))
            .with_flush_interval(Duration::from_millis(50))
    }

    /// Config rooted in `root` that archives through `tool`.
    pub fn test_config_with_tool(root: &Path, tool: &FakeArchiveTool) -> PersistenceConfig {
        test_config(root).with_archive_tool(tool.program_str())
    }

    /// A shell script standing in for 7-Zip.
    ///
    /// `a -t<fmt> -m0=<method> <archive> <source>` copies the source to the
    /// archive path. `x <archive> -o<dir> -aos` copies the archive to
    /// `<dir>/<stem>.db` unless that file exists. Every invocation appends its
    /// command letter to a log so tests can count them.
    #[derive(Debug, Clone)]
    pub struct FakeArchiveTool {
        program: PathBuf,
        log: PathBuf,
    }

    impl FakeArchiveTool {
        pub fn install(dir: &Path) -> io::Result<Self> {
            Self::install_with(dir, "", "")
        }

        /// Every invocation sleeps `secs` before doing its work.
        pub fn install_slow(dir: &Path, secs: u64) -> io::Result<Self> {
            Self::install_with(dir, &format!("sleep {secs}"), "")
        }

        /// Every invocation exits with `code` without doing anything.
        pub fn install_failing(dir: &Path, code: i32) -> io::Result<Self> {
            Self::install_with(
                dir,
                "",
                &format!("echo \"simulated failure\" >&2\nexit {code}"),
            )
        }

        fn install_with(dir: &Path, delay: &str, failure: &str) -> io::Result<Self> {
            std::fs::create_dir_all(dir)?;
            let program = dir.join("fake-7z.sh");
            let log = dir.join("fake-7z.log");

            let script = format!(
                r#"#!/bin/sh
echo "$1" >> '{log}'
{delay}
{failure}
case "$1" in
  a)
    cp "$5" "$4.tmp" && mv "$4.tmp" "$4"
    ;;
  x)
    out="${{3#-o}}"
    name=$(basename "$2")
    target="$out/${{name%.*}}.db"
    if [ ! -e "$target" ]; then
      cp "$2" "$target.tmp" && mv "$target.tmp" "$target"
    fi
    ;;
  *)
    echo "unsupported command $1" >&2
    exit 7
    ;;
esac
"#,
                log = log.display(),
            );
            std::fs::write(&program, script)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755))?;
            }

            Ok(Self { program, log })
        }

        pub fn program(&self) -> &Path {
            &self.program
        }

        pub fn program_str(&self) -> String {
            self.program.display().to_string()
        }

        /// How many times the tool ran with command letter `command`.
        pub fn invocations(&self, command: &str) -> usize {
            std::fs::read_to_string(&self.log)
                .map(|log| log.lines().filter(|line| *line == command).count())
                .unwrap_or(0)
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over `EmberResult`.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &EmberResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &EmberResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &EmberResult<T>) {
        match result {
            Err(EmberError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_archive_error<T: std::fmt::Debug>(result: &EmberResult<T>) {
        match result {
            Err(EmberError::Archive(_)) => {}
            other => panic!("Expected Archive error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &EmberResult<T>) {
        match result {
            Err(EmberError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    /// Assert that a range was rejected for spanning `span` periods.
    #[track_caller]
    pub fn assert_span_exceeded<T: std::fmt::Debug>(result: &EmberResult<T>, span: u32) {
        match result {
            Err(EmberError::Validation(ValidationError::SpanExceeded { span: got, .. })) => {
                assert_eq!(*got, span, "Wrong span in SpanExceeded error");
            }
            other => panic!("Expected SpanExceeded({}), got: {:?}", span, other),
        }
    }

    #[track_caller]
    pub fn assert_writer_closed<T: std::fmt::Debug>(result: &EmberResult<T>) {
        match result {
            Err(EmberError::Storage(StorageError::WriterClosed { .. })) => {}
            other => panic!("Expected WriterClosed error, got: {:?}", other),
        }
    }
}
