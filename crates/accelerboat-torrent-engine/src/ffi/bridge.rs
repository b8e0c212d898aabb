#[allow(missing_docs)]
#[cxx::bridge(namespace = "accelerboat")]
pub mod ffi {
    #[derive(Debug)]
    struct SessionOptions {
        download_root: String,
        resume_dir: String,
    }

    /// Seeds a torrent synthesised from a local file already held by this node.
    #[derive(Debug)]
    struct CreateTorrentRequest {
        digest: String,
        source_path: String,
        announce: String,
        piece_length: u64,
    }

    /// Admits a torrent described by a peer-supplied metainfo and downloads it.
    #[derive(Debug)]
    struct AddFromMetainfoRequest {
        digest: String,
        announce: String,
        piece_length: u64,
        length: u64,
        dest_path: String,
    }

    #[derive(Debug)]
    struct NativeEvent {
        digest: String,
        kind: NativeEventKind,
        bytes_completed: u64,
        bytes_total: u64,
        message: String,
    }

    #[derive(Debug)]
    enum NativeEventKind {
        GotInfo,
        Progress,
        Completed,
        Error,
    }

    unsafe extern "C++" {
        include!("accelerboat/session.hpp");

        type Session;

        #[must_use]
        fn new_session(options: &SessionOptions) -> UniquePtr<Session>;
        #[must_use]
        fn create_torrent(self: Pin<&mut Session>, request: &CreateTorrentRequest) -> String;
        #[must_use]
        fn add_from_metainfo(self: Pin<&mut Session>, request: &AddFromMetainfoRequest) -> String;
        #[must_use]
        fn remove_torrent(self: Pin<&mut Session>, digest: &str) -> String;
        #[must_use]
        fn poll_events(self: Pin<&mut Session>) -> Vec<NativeEvent>;
    }
}
