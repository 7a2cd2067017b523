use crate::{
    Result,
    phase::RevealAction,
};
use alloy::{
    network::{
        Ethereum,
        EthereumWallet,
    },
    primitives::{
        Address,
        TxHash,
        U256,
    },
    providers::{
        DynProvider,
        PendingTransactionBuilder,
        Provider,
        ProviderBuilder,
    },
    signers::local::PrivateKeySigner,
};
use anyhow::{
    Context,
    anyhow,
    bail,
};
use sweeper_abi::{
    ClickedMask,
    TILE_COUNT,
    contract_instance,
};
use url::Url;

/// Sends resolution transactions for pending requests.
pub trait RevealSubmitter {
    fn head_block(&self) -> impl Future<Output = Result<u64>>;

    /// Broadcasts `action` for `request_id`, returning once the node accepted it.
    fn submit(
        &self,
        request_id: u64,
        action: RevealAction,
    ) -> impl Future<Output = Result<TxHash>>;
}

/// `getGameState(gameId)` as read from the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnChainGame {
    pub game_id: u64,
    pub pool: U256,
    pub winner: Option<Address>,
    pub active: bool,
    pub clicked_mask: ClickedMask,
}

#[derive(Clone)]
pub struct AlloyChain {
    provider: DynProvider,
    contract: Address,
    sender: Option<Address>,
}

impl AlloyChain {
    pub fn read_only(rpc_url: Url, contract: Address) -> Self {
        let provider = ProviderBuilder::new().connect_http(rpc_url).erased();
        Self {
            provider,
            contract,
            sender: None,
        }
    }

    pub fn with_signer(rpc_url: Url, contract: Address, signer: PrivateKeySigner) -> Self {
        let sender = signer.address();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(rpc_url)
            .erased();
        Self {
            provider,
            contract,
            sender: Some(sender),
        }
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn sender(&self) -> Option<Address> {
        self.sender
    }

    pub async fn current_game_id(&self) -> Result<u64> {
        let game_id = contract_instance(self.contract, self.provider.clone())
            .gameId()
            .call()
            .await
            .context("calling gameId()")?;
        u64::try_from(game_id).map_err(|_| anyhow!("gameId() {game_id} exceeds 64 bits"))
    }

    pub async fn game_state(&self, game_id: u64) -> Result<OnChainGame> {
        let state = contract_instance(self.contract, self.provider.clone())
            .getGameState(U256::from(game_id))
            .call()
            .await
            .with_context(|| format!("calling getGameState({game_id})"))?;
        Ok(OnChainGame {
            game_id,
            pool: state.pool,
            winner: (state.winner != Address::ZERO).then_some(state.winner),
            active: state.active,
            clicked_mask: ClickedMask::from_word(state.clickedMask),
        })
    }

    pub async fn fee(&self) -> Result<U256> {
        contract_instance(self.contract, self.provider.clone())
            .FEE()
            .call()
            .await
            .context("calling FEE()")
    }

    /// Pays `fee` to commit a click on `tile_index`.
    pub async fn click(&self, tile_index: u8, fee: U256) -> Result<TxHash> {
        if tile_index >= TILE_COUNT {
            bail!("tile {tile_index} is off the board");
        }
        let sender = self
            .sender
            .ok_or_else(|| anyhow!("no signing key configured; cannot click"))?;
        let pending = contract_instance(self.contract, self.provider.clone())
            .click(U256::from(tile_index))
            .value(fee)
            .send()
            .await
            .with_context(|| format!("sending click({tile_index}) from {sender}"))?;
        Ok(track_receipt(pending, format!("click tile {tile_index}")))
    }
}

impl RevealSubmitter for AlloyChain {
    async fn head_block(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .context("eth_blockNumber")
    }

    async fn submit(&self, request_id: u64, action: RevealAction) -> Result<TxHash> {
        if self.sender.is_none() {
            bail!("no signing key configured; cannot send {action} for request {request_id}");
        }
        let instance = contract_instance(self.contract, self.provider.clone());
        let request = U256::from(request_id);
        let pending = match action {
            RevealAction::Reveal => instance.revealOutcome(request).send().await,
            RevealAction::Rescue => instance.rescueExpiredClick(request).send().await,
        }
        .with_context(|| format!("sending {action} for request {request_id}"))?;
        Ok(track_receipt(pending, format!("{action} request {request_id}")))
    }
}

/// Waits for the receipt off the calling task so other requests keep moving.
fn track_receipt(pending: PendingTransactionBuilder<Ethereum>, label: String) -> TxHash {
    let tx_hash = *pending.tx_hash();
    tokio::spawn(async move {
        match pending.get_receipt().await {
            Ok(receipt) if receipt.status() => {
                tracing::info!(%tx_hash, block = ?receipt.block_number, "{label} confirmed");
            }
            Ok(_) => {
                tracing::warn!(%tx_hash, "{label} reverted");
            }
            Err(e) => {
                tracing::warn!(%tx_hash, "{label} receipt unavailable: {e}");
            }
        }
    });
    tx_hash
}
