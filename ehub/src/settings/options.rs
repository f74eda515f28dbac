use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "ehubd")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Storage directory, overrides `storage.dir`
    #[structopt(name = "storage-dir", long)]
    pub storage_dir: Option<String>,
}
