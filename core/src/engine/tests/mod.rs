//! Tests for the dialog engine
//!
//! Organized by feature area

mod helpers;
