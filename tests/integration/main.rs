// Integration tests run the whole relay against the in-memory broker.

mod connection_test;
mod relay_test;
mod resilience_test;
mod support;
