//! Simulated clients sharing one relay.

use chelonia_core::{
    ChelError, Chelonia, CheloniaConfig, ContractMeta, ContractRegistry, ContractState, CreateContract, Hooks,
    MemoryStorage,
};
use chelonia_proto::ContractId;

use crate::{
    fixtures::{COUNTER, Identity},
    sim_env::SimEnv,
    sim_server::{SharedSimServer, create_shared_server},
    sim_transport::SimTransport,
};

/// Engine type every simulated client runs.
pub type SimEngine = Chelonia<SimEnv, MemoryStorage, SimTransport>;

/// Upper bound on delivery rounds before [`SimCluster::quiesce`] gives up.
const MAX_QUIESCE_ROUNDS: usize = 64;

/// One simulated client.
pub struct SimClient {
    /// The engine
    pub engine: SimEngine,
    /// Its relay connection
    pub transport: SimTransport,
    /// Its storage, kept to restart the engine over it
    pub storage: MemoryStorage,
    /// Its environment
    pub env: SimEnv,
    /// Keys it created contracts with
    pub identity: Identity,
}

impl SimClient {
    /// Client on `server` holding its identity's secrets.
    pub fn new(server: SharedSimServer, seed: u64, config: CheloniaConfig, registry: ContractRegistry) -> Self {
        Self::with_hooks(server, seed, config, registry, chelonia_core::NoopHooks)
    }

    /// Client with observer hooks.
    pub fn with_hooks(
        server: SharedSimServer,
        seed: u64,
        config: CheloniaConfig,
        registry: ContractRegistry,
        hooks: impl Hooks,
    ) -> Self {
        let env = SimEnv::with_seed(seed);
        let storage = MemoryStorage::new();
        let transport = SimTransport::connect(server);
        let identity = Identity::generate(&env);
        let engine = Chelonia::builder(env.clone(), storage.clone(), transport.clone())
            .config(config)
            .registry(registry)
            .hooks(hooks)
            .build();
        engine.secrets().insert(identity.signing.clone());
        engine.secrets().insert(identity.encryption.clone());
        Self { engine, transport, storage, env, identity }
    }

    /// Create a counter contract keyed by this client's identity.
    pub async fn create_counter(&self) -> Result<ContractId, ChelError> {
        self.engine
            .create_contract(CreateContract {
                contract_type: COUNTER.into(),
                keys: self.identity.contract_keys(),
                signing_key_id: self.identity.signing_id(),
                encrypt_private_to: None,
            })
            .await
    }

    /// Deliver pushes and await background work until both run dry.
    ///
    /// Returns the number of events delivered.
    pub async fn quiesce(&self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_QUIESCE_ROUNDS {
            self.engine.settle().await;
            let delivered = self.transport.deliver(&self.engine).await;
            total += delivered;
            if delivered == 0 {
                self.engine.settle().await;
                if self.transport.deliver(&self.engine).await == 0 {
                    return total;
                }
            }
        }
        tracing::warn!(client = self.transport.client_id(), "Client did not quiesce");
        total
    }

    /// State snapshot.
    #[must_use]
    pub fn state(&self, contract_id: &ContractId) -> Option<ContractState> {
        self.engine.state(contract_id)
    }

    /// Meta snapshot.
    #[must_use]
    pub fn meta(&self, contract_id: &ContractId) -> Option<ContractMeta> {
        self.engine.meta(contract_id)
    }
}

/// Clients sharing one relay, seeded from one number.
pub struct SimCluster {
    /// The relay
    pub server: SharedSimServer,
    /// Clients in creation order
    pub clients: Vec<SimClient>,
    seed: u64,
}

impl SimCluster {
    /// `count` clients with default configuration and `registry`.
    pub fn new(seed: u64, count: usize, registry: &ContractRegistry) -> Self {
        Self::with_config(seed, count, registry, &CheloniaConfig::default())
    }

    /// `count` clients with `config`.
    pub fn with_config(seed: u64, count: usize, registry: &ContractRegistry, config: &CheloniaConfig) -> Self {
        let server = create_shared_server();
        let clients = (0..count)
            .map(|index| SimClient::new(server.clone(), client_seed(seed, index), config.clone(), registry.clone()))
            .collect();
        Self { server, clients, seed }
    }

    /// Cluster over clients built by the caller, all connected to `server`.
    #[must_use]
    pub fn with_clients(seed: u64, server: SharedSimServer, clients: Vec<SimClient>) -> Self {
        Self { server, clients, seed }
    }

    /// Seed the cluster was built from.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Client `index`.
    #[must_use]
    pub fn client(&self, index: usize) -> &SimClient {
        &self.clients[index]
    }

    /// Quiesce every client repeatedly until no client receives anything.
    pub async fn quiesce(&self) {
        for _ in 0..MAX_QUIESCE_ROUNDS {
            let mut delivered = 0;
            for client in &self.clients {
                delivered += client.quiesce().await;
            }
            if delivered == 0 {
                return;
            }
        }
        tracing::warn!(seed = self.seed, "Cluster did not quiesce");
    }
}

/// Per-client seed derived from the cluster seed.
#[must_use]
pub fn client_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(index as u64 + 1)
}
