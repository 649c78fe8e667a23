use std::path::PathBuf;

const CHANNEL_PREFIX: &str = "channel_";
const DATA_FILE_SUFFIX: &str = "dat";

/// Directory holding one channel's files, e.g. `channel_2`.
pub fn channel_dir_name(channel: u32) -> String {
    format!("{CHANNEL_PREFIX}{channel}")
}

/// Name of a channel data file, e.g. `channel_2_17.dat`.
pub fn data_file_name(channel: u32, number: u64) -> String {
    format!("{CHANNEL_PREFIX}{channel}_{number}.{DATA_FILE_SUFFIX}")
}

/// File number of `name` if it is a data file of `channel`.
pub fn parse_data_file_number(channel: u32, name: &str) -> Option<u64> {
    let stem = name.strip_suffix(DATA_FILE_SUFFIX)?.strip_suffix('.')?;
    let rest = stem.strip_prefix(CHANNEL_PREFIX)?;
    let (ch, number) = rest.split_once('_')?;
    if ch.parse::<u32>().ok()? != channel {
        return None;
    }
    number.parse().ok()
}

/// One storage file as the backup sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryFile {
    pub channel: u32,
    pub number: u64,
    /// Location of the live file on the local filesystem.
    pub path: PathBuf,
    /// Current length of the live file.
    pub length: u64,
}

impl InventoryFile {
    /// Key of the mirrored file in a blob store.
    pub fn backup_key(&self) -> String {
        backup_key(self.channel, self.number)
    }
}

pub(crate) fn backup_key(channel: u32, number: u64) -> String {
    format!("{}/{}", channel_dir_name(channel), data_file_name(channel, number))
}

/// A channel's storage files, ordered by file number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInventory {
    pub channel: u32,
    pub files: Vec<InventoryFile>,
}

impl ChannelInventory {
    pub fn new(channel: u32, mut files: Vec<InventoryFile>) -> Self {
        files.sort_by_key(|f| f.number);
        Self { channel, files }
    }

    pub fn last_number(&self) -> Option<u64> {
        self.files.last().map(|f| f.number)
    }

    pub fn get(&self, number: u64) -> Option<&InventoryFile> {
        self.files.iter().find(|f| f.number == number)
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }
}
