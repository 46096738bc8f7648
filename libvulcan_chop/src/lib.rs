//! # vulcan_chop
//!
//! vulcan_chop chops a VULCAN neutron time-of-flight event run into time slices and
//! reduces every slice to a focused powder diffraction pattern in the GSAS format. Slices
//! can be defined by fixed time steps, overlapping time windows, the value of a sample log
//! (temperature, strain, load) or a hand picked list of times. The focusing of the slices
//! is spread over a fixed pool of worker threads.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, see the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installation instructions.
//!
//! To build and install the CLI use `cargo install --path ./vulcan_chop_cli` from the top
//! level vulcan_chop repository.
//!
//! ## Pipeline
//!
//! A chop-and-reduce run goes through the following stages:
//!
//! 1. The event file is loaded and the detectors are aligned with the calibration.
//! 2. A [`splitter_builder::SplitterBuilder`] turns the requested chop into a
//!    [`splitter::SplitterSet`]: time segments, each routed to a target.
//! 3. Runs with many targets are chopped in batches (see
//!    [`orchestrator::decide_strategy`]) so that only a bounded number of chopped
//!    workspaces exists at once.
//! 4. Each batch of chopped workspaces is focused by a [`focus_pool::FocusWorkerPool`]:
//!    d-spacing, diffraction focus into banks, back to TOF, instrument geometry.
//! 5. The [`gsas_writer::GsasWriter`] renders each pattern; the files are written in
//!    sequence order as `1.gda`, `2.gda`, ...
//! 6. A lookup file `<run>_chop_info.txt` records what was written, so a later chop of
//!    the same run can recover the previous state.
//!
//! Everything physical goes through the [`instrument::Instrument`] trait.
//! [`instrument::event_store::EventStore`] is the bundled implementation, which reads the
//! `.vevt` event file format.
//!
//! ## Configuration
//!
//! Jobs are described by a YAML [`config::Config`]. A template can be generated with
//! `vulcan_chop_cli new -p chop.yaml`. A minimal file looks like:
//!
//! ```yml
//! run_number: 164960
//! ipts: 22752
//! event_file: /SNS/VULCAN/IPTS-22752/nexus/VULCAN_164960.vevt
//! output_dir: /SNS/VULCAN/IPTS-22752/shared/chopped/164960
//! splitter:
//!   kind: Time
//!   start: null
//!   stop: null
//!   step: 60.0
//! n_threads: 24
//! memory_ceiling: 200
//! ```
//!
//! The remaining fields (grouping, binning, calibration) default to the standard VULCAN
//! three bank setup.
//!
//! ### Splitter Files
//!
//! Splitter files are tab separated text with one `start stop target` line per segment.
//! Times at or below fifteen years are seconds relative to the run start, larger times
//! are seconds since the Unix epoch. Integer targets are written bare; a string tag that
//! could be mistaken for one (`"7"`, blank, padded) is written in double quotes. Optional
//! header comments carry metadata:
//!
//! ```text
//! # Reference Run Number = 164960
//! # Run Start Time = 1599999990.000000000
//! 0.000000000	60.000000000	0
//! 60.000000000	120.000000000	1
//! ```
//!
//! ## Output
//!
//! Next to the GSAS files the CLI writes a log file, `vulcan_chop.log`. Intervals that
//! received no events produce no file and are reported as warnings, not errors.
pub mod binning;
pub mod calibration;
pub mod chop_index;
pub mod config;
pub mod constants;
pub mod error;
pub mod focus_pool;
pub mod grouping;
pub mod gsas_writer;
pub mod instrument;
pub mod orchestrator;
pub mod partition;
pub mod pattern;
pub mod splitter;
pub mod splitter_builder;
pub mod worker_status;
