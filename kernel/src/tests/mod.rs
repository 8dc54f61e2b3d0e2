//! Cross-subsystem scenario tests.
//!
//! Module-level unit tests live next to their code; the tests here drive
//! several subsystems together: the memory stack through its public
//! surface, and the network stack end-to-end over a loopback device.
