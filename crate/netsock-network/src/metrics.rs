use prometheus::{IntCounter, IntCounterVec};

lazy_static::lazy_static! {
    pub(crate) static ref METRIC_ACCEPTED_CONNECTION_COUNT: IntCounter =
        prometheus::register_int_counter!(
            "netsock_accepted_connection_count",
            "Number of connections accepted by listeners").unwrap();
    pub(crate) static ref METRIC_CONNECT_COUNT: IntCounterVec =
        prometheus::register_int_counter_vec!(
            "netsock_connect_count",
            "Number of outgoing connection attempts, by result",
            &["result"]).unwrap();
    pub(crate) static ref METRIC_TLS_HANDSHAKE_COUNT: IntCounterVec =
        prometheus::register_int_counter_vec!(
            "netsock_tls_handshake_count",
            "Number of TLS handshakes, by side and result",
            &["side", "result"]).unwrap();
    pub(crate) static ref METRIC_BYTES_READ: IntCounter =
        prometheus::register_int_counter!(
            "netsock_bytes_read_total",
            "Bytes read from sockets").unwrap();
    pub(crate) static ref METRIC_BYTES_WRITTEN: IntCounter =
        prometheus::register_int_counter!(
            "netsock_bytes_written_total",
            "Bytes written to sockets, files included").unwrap();
    pub(crate) static ref METRIC_SENT_FILE_COUNT: IntCounterVec =
        prometheus::register_int_counter_vec!(
            "netsock_sent_file_count",
            "Number of files sent on sockets, by result",
            &["result"]).unwrap();
}

pub(crate) fn result_label<T, E>(res: &Result<T, E>) -> &'static str {
    match res {
        Ok(_) => "ok",
        Err(_) => "error",
    }
}
