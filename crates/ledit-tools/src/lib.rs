// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod capability;
pub mod outcome;
pub mod params;
pub mod registry;
pub mod security;

pub use capability::{AgentOps, NullOps};
pub use outcome::ToolOutcome;
pub use params::{ParamType, ParameterConfig, ValidatedArgs};
pub use registry::{
    AgentRole, DispatchContext, HandlerCtx, ToolCall, ToolConfig, ToolHandler, ToolRegistry,
};
pub use security::{GateDecision, LlmRiskValidator, RiskAssessment, RiskValidator, SecurityGate};

pub use builtin::install_builtin;
