/*
 * Architecture Layer
 *
 * Thin layer backing the opaque architecture collaborators the core
 * consumes: interrupt flag control, the context switch, segment/interrupt
 * tables, the PIC, the UART and the MMU hooks. Everything above this module
 * is architecture-neutral.
 */

pub mod x86_64;

pub use x86_64::{halt, pause};
