pub mod video_io;
