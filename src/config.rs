/// Default read granularity on the connection.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024;

/// Per-client protocol options.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Set FCGI_KEEP_CONN in BeginRequest, asking the application to keep the connection
    /// open after the request ends.
    pub keep_connection: bool,
    /// Terminate the stdin stream with an empty Stdin record after the request content.
    pub close_stdin: bool,
    /// How many bytes to ask the connection for per read.
    pub read_chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            keep_connection: false,
            close_stdin: false,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}
