use std::path::PathBuf;

use argh::FromArgs;

/// keymint: payment and fulfillment node for the digital-license storefront.
#[derive(FromArgs, Debug)]
pub struct Args {
    /// path to an env file to load before reading configuration
    #[argh(option)]
    pub env_file: Option<PathBuf>,
}
