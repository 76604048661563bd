use {
    super::BlockContainer,
    crate::{Error, Result},
    anyhow::format_err,
    blockvault_protocol::BlockId,
    fs_err::{create_dir_all, read_dir, remove_file},
    std::{
        io::{ErrorKind, Write},
        path::{Path, PathBuf},
    },
    tempfile::NamedTempFile,
    tracing::debug,
};

/// Container that stores each block as a file, fanned out into subdirectories
/// named after the first three hex characters of the block id.
#[derive(Debug)]
pub struct OnDiskContainer {
    root: PathBuf,
    tmp: PathBuf,
}

fn block_paths(root: &Path, id: &BlockId) -> (PathBuf, PathBuf) {
    let name = id.to_string();
    let dir = root.join(name.get(..3).unwrap_or_default());
    let file_path = dir.join(name.get(3..).unwrap_or_default());
    (dir, file_path)
}

impl OnDiskContainer {
    #[inline]
    pub fn new(root: PathBuf) -> Result<Self> {
        if !root.try_exists()? {
            return Err(Error::NotFound(format!(
                "container root {} doesn't exist",
                root.display()
            )));
        }
        let tmp = root.join("tmp");
        create_dir_all(&tmp)?;
        Ok(Self { root, tmp })
    }

    #[must_use]
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlockContainer for OnDiskContainer {
    fn get(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        let (_, path) = block_paths(&self.root, id);
        match fs_err::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        let (dir, path) = block_paths(&self.root, id);
        create_dir_all(dir)?;
        let mut file = NamedTempFile::new_in(&self.tmp)?;
        file.write_all(data)?;
        file.as_file().sync_data()?;
        file.persist(&path).map_err(|err| err.error)?;
        Ok(())
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        let (_, path) = block_paths(&self.root, id);
        match remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        let (_, path) = block_paths(&self.root, id);
        Ok(path.try_exists()?)
    }

    fn list_ids(&self) -> Result<Vec<BlockId>> {
        let mut ids = Vec::new();
        for dir_entry in read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let prefix = dir_entry.file_name();
            let Some(prefix) = prefix.to_str() else {
                continue;
            };
            if prefix.len() != 3 || !dir_entry.file_type()?.is_dir() {
                continue;
            }
            for file_entry in read_dir(dir_entry.path())? {
                let file_entry = file_entry?;
                let name = file_entry.file_name();
                let parsed = name
                    .to_str()
                    .ok_or_else(|| format_err!("non-utf8 file name in container"))
                    .and_then(|name| format!("{prefix}{name}").parse::<BlockId>());
                match parsed {
                    Ok(id) => ids.push(id),
                    Err(err) => debug!(?name, ?err, "skipping unexpected file in container"),
                }
            }
        }
        Ok(ids)
    }
}
