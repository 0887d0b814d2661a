//! Change-order computation and dependency-ordered apply/preview over
//! runtime drivers.

#![forbid(unsafe_code)]

pub mod graph;
pub mod models;
pub mod operator;

pub use models::{
    build_change_order, ActionType, ChangeOrder, ChangeStep, Message, MessageStatus, Request,
};
pub use operator::{ApplyResponse, CancelHandle, Operator, PreviewResponse};
