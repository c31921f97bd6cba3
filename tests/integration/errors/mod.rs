mod protocol_test;
mod retry_test;
