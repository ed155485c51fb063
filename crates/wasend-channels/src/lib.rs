//! # wasend-channels
//!
//! Messaging device clients for wasend.

pub mod qr;
pub mod whatsapp;
