//! ngfw-updater - Ruleset update orchestration for a managed NGFW appliance
//!
//! Stages a signed ruleset artifact, pushes it through the appliance's
//! maintenance update and confirms the rules went live.

pub mod engine;
