//! Documentation module for the Mercury overlay.
//!
//! This module contains high-level documentation to explain the project,
//! define terms and aid navigation of the other documentation.

pub mod glossary;
